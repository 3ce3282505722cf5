//! Named pub/sub nodes and their store/clear reconciliation.

use crate::stanza::Stanza;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubSubItem {
    pub id: String,
    pub data: String,
    /// Server timestamp in seconds, when the server sent one.
    pub stamp: Option<i64>,
    pub received_at: DateTime<Utc>,
}

impl PubSubItem {
    pub fn new(id: impl Into<String>, data: impl Into<String>, stamp: Option<i64>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            stamp,
            received_at: Utc::now(),
        }
    }

    /// `<item id stamp>data</item>`; an item without an id is rejected.
    pub fn from_stanza(node: &Stanza) -> Option<Self> {
        let id = node.attr("id").filter(|id| !id.is_empty())?;
        let stamp = node.attr("stamp").and_then(|s| s.trim().parse().ok());
        Some(Self::new(id, node.text().unwrap_or_default(), stamp))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }

    /// The server stamp advanced by the time elapsed since the item arrived.
    pub fn stamp_offset(&self) -> Option<i64> {
        self.stamp_offset_at(Utc::now())
    }

    pub fn stamp_offset_at(&self, now: DateTime<Utc>) -> Option<i64> {
        let elapsed = now.timestamp() - self.received_at.timestamp();
        self.stamp.map(|stamp| stamp + elapsed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubSubNode {
    pub name: String,
    pub items: Vec<PubSubItem>,
}

impl PubSubNode {
    pub fn new(name: impl Into<String>, items: Vec<PubSubItem>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    /// `<node name><item/>...</node>`; items without ids are dropped.
    pub fn from_stanza(node: &Stanza) -> Option<Self> {
        let name = node.attr("name")?;
        let items = node
            .descendants("item")
            .into_iter()
            .filter_map(|item| {
                let parsed = PubSubItem::from_stanza(item);
                if parsed.is_none() {
                    warn!(target: "PubSub", "Dropping item without id in node '{name}'");
                }
                parsed
            })
            .collect();
        Some(Self::new(name, items))
    }

    /// Every `<node/>` below `parent`.
    pub fn parse_all(parent: &Stanza) -> Vec<Self> {
        parent
            .descendants("node")
            .into_iter()
            .filter_map(Self::from_stanza)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&PubSubItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub node: PubSubNode,
    /// Items that replaced a current item or were appended.
    pub stored: Vec<PubSubItem>,
}

/// Replaces matching items in place and appends the rest. A repeated id in
/// `incoming` counts once, with its last value.
pub fn merge(current: Option<&PubSubNode>, incoming: PubSubNode) -> Merged {
    let mut pending: Vec<PubSubItem> = Vec::with_capacity(incoming.items.len());
    for item in incoming.items {
        match pending.iter_mut().find(|p| p.id == item.id) {
            Some(slot) => *slot = item,
            None => pending.push(item),
        }
    }
    let mut items = Vec::new();
    let mut stored = Vec::new();

    for item in current.map(|c| c.items.as_slice()).unwrap_or_default() {
        match pending.iter().position(|p| p.id == item.id) {
            Some(index) => {
                let replacement = pending.remove(index);
                stored.push(replacement.clone());
                items.push(replacement);
            }
            None => items.push(item.clone()),
        }
    }

    for item in pending {
        stored.push(item.clone());
        items.push(item);
    }

    Merged {
        node: PubSubNode::new(incoming.name, items),
        stored,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cleared {
    pub node: PubSubNode,
    pub removed: Vec<PubSubItem>,
}

/// Drops every current item whose id is listed in `incoming`.
pub fn clear(current: Option<&PubSubNode>, incoming: &PubSubNode) -> Cleared {
    let (removed, kept): (Vec<_>, Vec<_>) = current
        .map(|c| c.items.clone())
        .unwrap_or_default()
        .into_iter()
        .partition(|item| incoming.items.iter().any(|i| i.id == item.id));

    Cleared {
        node: PubSubNode::new(incoming.name.clone(), kept),
        removed,
    }
}

/// The locally held copy of every node.
#[derive(Debug, Default)]
pub struct PubSubStore {
    nodes: IndexMap<String, PubSubNode>,
}

impl PubSubStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PubSubNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PubSubNode> {
        self.nodes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn store(&mut self, incoming: Vec<PubSubNode>) -> Vec<Merged> {
        incoming
            .into_iter()
            .map(|node| {
                let merged = merge(self.nodes.get(&node.name), node);
                self.nodes
                    .insert(merged.node.name.clone(), merged.node.clone());
                merged
            })
            .collect()
    }

    pub fn clear(&mut self, incoming: &[PubSubNode]) -> Vec<Cleared> {
        incoming
            .iter()
            .filter_map(|node| {
                let current = self.nodes.get(&node.name)?;
                let cleared = clear(Some(current), node);
                self.nodes
                    .insert(cleared.node.name.clone(), cleared.node.clone());
                Some(cleared)
            })
            .collect()
    }

    /// Empties the store, returning what it held.
    pub fn drain(&mut self) -> Vec<PubSubNode> {
        self.nodes.drain(..).map(|(_, node)| node).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::StanzaBuilder;
    use chrono::Duration;

    fn node(items: &[(&str, &str)]) -> PubSubNode {
        PubSubNode::new(
            "presence.web",
            items
                .iter()
                .map(|(id, v)| PubSubItem::new(*id, *v, None))
                .collect(),
        )
    }

    fn pairs(node: &PubSubNode) -> Vec<(&str, &str)> {
        node.items
            .iter()
            .map(|i| (i.id.as_str(), i.data.as_str()))
            .collect()
    }

    #[test]
    fn test_merge_replaces_in_place() {
        let current = node(&[("1", "a"), ("2", "b")]);
        let merged = merge(Some(&current), node(&[("2", "B")]));

        assert_eq!(pairs(&merged.node), vec![("1", "a"), ("2", "B")]);
        assert_eq!(merged.stored.len(), 1);
        assert_eq!(merged.stored[0].id, "2");
    }

    #[test]
    fn test_merge_appends_unmatched() {
        let current = node(&[("1", "a")]);
        let merged = merge(Some(&current), node(&[("2", "b")]));
        assert_eq!(pairs(&merged.node), vec![("1", "a"), ("2", "b")]);
        assert_eq!(merged.stored.len(), 1);
    }

    #[test]
    fn test_merge_collapses_repeated_ids() {
        let merged = merge(None, node(&[("x", "1"), ("x", "2")]));
        assert_eq!(pairs(&merged.node), vec![("x", "2")]);
        assert_eq!(merged.stored.len(), 1);

        let current = node(&[("x", "0"), ("y", "a")]);
        let merged = merge(Some(&current), node(&[("x", "1"), ("x", "2")]));
        assert_eq!(pairs(&merged.node), vec![("x", "2"), ("y", "a")]);
        assert_eq!(merged.stored.len(), 1);
    }

    #[test]
    fn test_merge_into_missing_node() {
        let merged = merge(None, node(&[("1", "a"), ("2", "b")]));
        assert_eq!(merged.stored.len(), 2);
        assert_eq!(pairs(&merged.node), vec![("1", "a"), ("2", "b")]);
    }

    #[test]
    fn test_clear_reports_only_removed_items() {
        let current = node(&[("1", "a"), ("2", "b"), ("3", "c")]);
        let cleared = clear(Some(&current), &node(&[("2", ""), ("9", "")]));

        assert_eq!(pairs(&cleared.node), vec![("1", "a"), ("3", "c")]);
        assert_eq!(cleared.removed.len(), 1);
        assert_eq!(cleared.removed[0].id, "2");
    }

    #[test]
    fn test_store_then_clear_then_drain() {
        let mut store = PubSubStore::new();
        store.store(vec![node(&[("1", "a"), ("2", "b")])]);
        store.store(vec![node(&[("2", "B"), ("3", "c")])]);
        assert_eq!(
            pairs(store.get("presence.web").unwrap()),
            vec![("1", "a"), ("2", "B"), ("3", "c")]
        );

        let cleared = store.clear(&[node(&[("1", "")]), PubSubNode::new("unknown", vec![])]);
        assert_eq!(cleared.len(), 1);

        let drained = store.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].items.len(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_parse_nodes_and_json() {
        let event = StanzaBuilder::new("event")
            .child(
                StanzaBuilder::new("node")
                    .attr("name", "settings")
                    .child(
                        StanzaBuilder::new("item")
                            .attr("id", "theme")
                            .attr("stamp", "1700000000")
                            .text(r#"{"dark":true}"#)
                            .build(),
                    )
                    .child(StanzaBuilder::new("item").text("orphan").build())
                    .build(),
            )
            .build();

        let nodes = PubSubNode::parse_all(&event);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].items.len(), 1);
        let item = &nodes[0].items[0];
        let value: serde_json::Value = item.json().unwrap();
        assert_eq!(value["dark"], serde_json::Value::Bool(true));
        assert_eq!(item.stamp, Some(1_700_000_000));
    }

    #[test]
    fn test_stamp_offset_advances_with_local_time() {
        let item = PubSubItem::new("x", "", Some(100));
        let later = item.received_at + Duration::seconds(7);
        assert_eq!(item.stamp_offset_at(later), Some(107));
        assert_eq!(PubSubItem::new("y", "", None).stamp_offset_at(later), None);
    }
}
