//! Presence snapshots and the resource diff between consecutive snapshots.

use crate::stanza::Stanza;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Offline,
    Online,
    Away,
    Dnd,
    Busy,
}

impl Availability {
    /// Maps a presence `show` value; an absent `show` on an available
    /// presence means online.
    pub fn from_show(show: Option<&str>) -> Self {
        match show {
            None | Some("") | Some("chat") => Availability::Online,
            Some("away") | Some("xa") => Availability::Away,
            Some("dnd") => Availability::Dnd,
            Some("busy") => Availability::Busy,
            Some(_) => Availability::Online,
        }
    }
}

/// A SIP registration of the user's account.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Registration {
    pub id: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub user_agent: Option<String>,
}

impl Registration {
    pub fn from_stanza(node: &Stanza) -> Option<Self> {
        let id = node.attr("id").filter(|id| !id.is_empty())?;
        Some(Self {
            id: id.to_string(),
            ip: node.attr("ip").map(str::to_string),
            port: node.attr("port").and_then(|p| p.parse().ok()),
            user_agent: node.attr("ua").map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PresenceSnapshot {
    pub online: bool,
    pub availability: Availability,
    pub message: Option<String>,
    pub location: Option<String>,
    /// Connected resource identifiers, in arrival order.
    pub resources: IndexSet<String>,
    pub registrations: Vec<Registration>,
}

impl PresenceSnapshot {
    pub fn offline() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAvailability {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceTransition {
    pub resource: String,
    pub availability: ResourceAvailability,
}

/// Resources that appeared (in `next` order) followed by resources that
/// disappeared (in `previous` order).
pub fn diff(previous: &PresenceSnapshot, next: &PresenceSnapshot) -> Vec<ResourceTransition> {
    let appeared = next
        .resources
        .iter()
        .filter(|r| !previous.resources.contains(*r))
        .map(|r| ResourceTransition {
            resource: r.clone(),
            availability: ResourceAvailability::Available,
        });
    let vanished = previous
        .resources
        .iter()
        .filter(|r| !next.resources.contains(*r))
        .map(|r| ResourceTransition {
            resource: r.clone(),
            availability: ResourceAvailability::Unavailable,
        });
    appeared.chain(vanished).collect()
}

/// Latest snapshot per entity.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    snapshots: IndexMap<String, PresenceSnapshot>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str) -> Option<&PresenceSnapshot> {
        self.snapshots.get(entity)
    }

    /// Installs `next` for `entity` and returns the transitions relative to
    /// what it replaced. An unknown entity diffs against an offline snapshot.
    pub fn replace(&mut self, entity: &str, next: PresenceSnapshot) -> Vec<ResourceTransition> {
        let previous = self
            .snapshots
            .insert(entity.to_string(), next)
            .unwrap_or_default();
        match self.snapshots.get(entity) {
            Some(current) => diff(&previous, current),
            None => Vec::new(),
        }
    }

    pub fn remove(&mut self, entity: &str) -> Option<PresenceSnapshot> {
        self.snapshots.shift_remove(entity)
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(resources: &[&str]) -> PresenceSnapshot {
        PresenceSnapshot {
            online: !resources.is_empty(),
            availability: Availability::Online,
            resources: resources.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let p = snapshot(&["web-1", "phone"]);
        assert!(diff(&p, &p).is_empty());
    }

    #[test]
    fn test_added_resource_is_single_available_transition() {
        let p = snapshot(&["web-1"]);
        let mut next = p.clone();
        next.resources.insert("x".to_string());

        assert_eq!(
            diff(&p, &next),
            vec![ResourceTransition {
                resource: "x".into(),
                availability: ResourceAvailability::Available,
            }]
        );
    }

    #[test]
    fn test_diff_orders_available_before_unavailable() {
        let previous = snapshot(&["a", "b", "c"]);
        let next = snapshot(&["c", "d", "a", "e"]);
        let transitions: Vec<_> = diff(&previous, &next)
            .into_iter()
            .map(|t| (t.resource, t.availability))
            .collect();
        assert_eq!(
            transitions,
            vec![
                ("d".to_string(), ResourceAvailability::Available),
                ("e".to_string(), ResourceAvailability::Available),
                ("b".to_string(), ResourceAvailability::Unavailable),
            ]
        );
    }

    #[test]
    fn test_roster_replace_diffs_against_previous() {
        let mut roster = PresenceRoster::new();
        let first = roster.replace("200@pbx.local", snapshot(&["web"]));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].availability, ResourceAvailability::Available);

        let second = roster.replace("200@pbx.local", snapshot(&[]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].availability, ResourceAvailability::Unavailable);
        assert!(!roster.get("200@pbx.local").unwrap().online);
    }

    #[test]
    fn test_availability_from_show() {
        assert_eq!(Availability::from_show(None), Availability::Online);
        assert_eq!(Availability::from_show(Some("xa")), Availability::Away);
        assert_eq!(Availability::from_show(Some("dnd")), Availability::Dnd);
    }
}
