//! Pub/sub nodes: local subscriptions, the node mirror and generic pub events.

use crate::client::{Client, ClientError};
use crate::handlers::{SessionListener, StanzaHandler};
use crate::request::InfoQuery;
use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, error, warn};
use sbcore::pubsub::{PubSubItem, PubSubNode, PubSubStore};
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaBuilder, StanzaKind};
use sbcore::types::events::{Event, NodeItemEvent, PubEvent};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const NS_PUB: &str = "urn:switchboard:pub";
pub const NS_PUB_SUBSCRIBE: &str = "urn:switchboard:pub:subscribe";
pub const NS_PUB_PULL: &str = "urn:switchboard:pub:pull";
pub const NS_PUB_EXECUTE: &str = "urn:switchboard:pub:execute";

pub(crate) const PRIORITY: i32 = 100;

/// Receives items broadcast to a subscribed node.
pub type NodeCallback = Arc<dyn Fn(&PubSubItem) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct PubSubState {
    store: PubSubStore,
    subscriptions: IndexMap<String, Vec<(SubscriptionId, NodeCallback)>>,
}

impl PubSubState {
    pub fn node(&self, name: &str) -> Option<&PubSubNode> {
        self.store.get(name)
    }

    pub fn nodes(&self) -> Vec<PubSubNode> {
        self.store.nodes().cloned().collect()
    }

    pub fn subscribed_nodes(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Registers a callback. Returns `true` when it is the node's first.
    fn add(&mut self, node: &str, id: SubscriptionId, callback: NodeCallback) -> bool {
        let callbacks = self.subscriptions.entry(node.to_string()).or_default();
        callbacks.push((id, callback));
        callbacks.len() == 1
    }

    /// Drops a callback. Returns `true` when the node has none left.
    fn remove(&mut self, node: &str, id: SubscriptionId) -> bool {
        let Some(callbacks) = self.subscriptions.get_mut(node) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        if callbacks.len() == before || !callbacks.is_empty() {
            return false;
        }
        self.subscriptions.shift_remove(node);
        true
    }

    /// Merges nodes into the mirror. Silent merges return no events.
    pub fn store(&mut self, nodes: Vec<PubSubNode>, silent: bool) -> (Vec<PubSubNode>, Vec<Event>) {
        let mut merged_nodes = Vec::new();
        let mut events = Vec::new();
        for merged in self.store.store(nodes) {
            if !silent {
                events.extend(merged.stored.into_iter().map(|item| {
                    Event::NodeStored(NodeItemEvent {
                        node: merged.node.name.clone(),
                        item,
                    })
                }));
            }
            merged_nodes.push(merged.node);
        }
        (merged_nodes, events)
    }

    pub fn clear(&mut self, nodes: &[PubSubNode]) -> Vec<Event> {
        self.store
            .clear(nodes)
            .into_iter()
            .flat_map(|cleared| {
                let node = cleared.node.name;
                cleared.removed.into_iter().map(move |item| {
                    Event::NodeCleared(NodeItemEvent {
                        node: node.clone(),
                        item,
                    })
                })
            })
            .collect()
    }

    /// Broadcast items are never stored. Returns the events plus the
    /// subscriber callbacks to run for each item.
    pub fn broadcast(&self, nodes: Vec<PubSubNode>) -> Vec<(Event, Vec<NodeCallback>)> {
        let mut out = Vec::new();
        for node in nodes {
            let callbacks: Vec<NodeCallback> = self
                .subscriptions
                .get(&node.name)
                .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            for item in node.items {
                let event = Event::NodeBroadcast(NodeItemEvent {
                    node: node.name.clone(),
                    item,
                });
                out.push((event, callbacks.clone()));
            }
        }
        out
    }

    pub fn teardown(&mut self) -> Vec<Event> {
        self.store
            .drain()
            .into_iter()
            .flat_map(|node| {
                let name = node.name;
                node.items.into_iter().map(move |item| {
                    Event::NodeCleared(NodeItemEvent {
                        node: name.clone(),
                        item,
                    })
                })
            })
            .collect()
    }
}

/// Reads a `urn:...:pub` event. Malformed JSON yields `None`.
pub fn parse_pub_event(event: &Stanza) -> Option<PubEvent> {
    let kind = event.attr("type").unwrap_or_default().to_string();
    let body = event.text().unwrap_or_default();
    match serde_json::from_str(body) {
        Ok(data) => Some(PubEvent { kind, data }),
        Err(e) => {
            warn!(target: "PubSub", "Dropping pub event '{kind}' with malformed body: {e}");
            None
        }
    }
}

fn lock(state: &Mutex<PubSubState>) -> MutexGuard<'_, PubSubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn subscribe_query(node: &str, subscribe: bool, silent: bool) -> InfoQuery {
    let mut query = InfoQuery::set(NS_PUB_SUBSCRIBE)
        .attr("action", if subscribe { "subscribe" } else { "unsubscribe" });
    if silent {
        query = query.attr("silent", "yes");
    }
    query.child(StanzaBuilder::new("node").attr("name", node).build())
}

/// Subscribes to `node` and merges the nodes carried in the `<response/>`.
/// The reply is a snapshot of what the node already holds, so nothing is
/// announced as stored.
async fn subscribe_node(
    client: &Arc<Client>,
    state: &Mutex<PubSubState>,
    node: &str,
    silent: bool,
) -> Result<Vec<PubSubNode>, ClientError> {
    let reply = client.send_iq(subscribe_query(node, true, silent)).await?;
    let nodes = reply
        .descendants("response")
        .first()
        .map(|response| PubSubNode::parse_all(response))
        .unwrap_or_default();
    let (merged, _) = lock(state).store(nodes, true);
    Ok(merged)
}

fn run_callbacks(callbacks: &[NodeCallback], item: &PubSubItem) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(item))).is_err() {
            error!(target: "PubSub", "Subscriber callback panicked on item '{}'", item.id);
        }
    }
}

struct PubSubHandler {
    state: Arc<Mutex<PubSubState>>,
}

#[async_trait]
impl StanzaHandler for PubSubHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        if let Some(event) = stanza.get_child_ns("event", NS_PUB) {
            if let Some(event) = parse_pub_event(event) {
                client.dispatch_event(Event::Pub(event));
            }
            return true;
        }

        let Some(event) = stanza.get_child_ns("event", NS_PUB_PULL) else {
            return false;
        };
        let nodes = PubSubNode::parse_all(event);
        match event.attr("type") {
            Some("store") => {
                let (_, events) = lock(&self.state).store(nodes, false);
                events.into_iter().for_each(|e| client.dispatch_event(e));
            }
            Some("clear") => {
                let events = lock(&self.state).clear(&nodes);
                events.into_iter().for_each(|e| client.dispatch_event(e));
            }
            Some("broadcast") => {
                let deliveries = lock(&self.state).broadcast(nodes);
                for (event, callbacks) in deliveries {
                    if let Event::NodeBroadcast(delivery) = &event {
                        run_callbacks(&callbacks, &delivery.item);
                    }
                    client.dispatch_event(event);
                }
            }
            other => debug!(target: "PubSub", "Ignoring pull event of type {other:?}"),
        }
        true
    }
}

#[async_trait]
impl SessionListener for PubSubHandler {
    /// Resubscribes every locally held node. Runs off the driver since each
    /// subscribe waits for its reply.
    async fn on_connected(&self, client: &Arc<Client>) {
        let nodes = lock(&self.state).subscribed_nodes();
        if nodes.is_empty() {
            return;
        }
        let client = client.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            for node in nodes {
                if let Err(e) = subscribe_node(&client, &state, &node, true).await {
                    warn!(target: "PubSub", "Failed to resubscribe '{node}': {e}");
                }
            }
        });
    }

    async fn on_disconnected(&self, client: &Arc<Client>, _error: Option<&TransportError>) {
        let events = lock(&self.state).teardown();
        events.into_iter().for_each(|e| client.dispatch_event(e));
    }
}

#[derive(Clone)]
pub struct PubSub {
    client: Arc<Client>,
    state: Arc<Mutex<PubSubState>>,
    next_id: Arc<AtomicU64>,
}

impl PubSub {
    pub fn new(client: Arc<Client>) -> Self {
        let state = Arc::new(Mutex::new(PubSubState::default()));
        let handler = Arc::new(PubSubHandler {
            state: state.clone(),
        });
        client.register_handler(StanzaKind::Message, PRIORITY, handler.clone());
        client.add_session_listener(handler);
        Self {
            client,
            state,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn node(&self, name: &str) -> Option<PubSubNode> {
        lock(&self.state).node(name).cloned()
    }

    pub fn nodes(&self) -> Vec<PubSubNode> {
        lock(&self.state).nodes()
    }

    pub fn subscribed_nodes(&self) -> Vec<String> {
        lock(&self.state).subscribed_nodes()
    }

    /// Registers `callback` for broadcasts on `node`. The first callback of a
    /// node subscribes to it silently when connected.
    pub async fn add(
        &self,
        node: &str,
        callback: impl Fn(&PubSubItem) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first = lock(&self.state).add(node, id, Arc::new(callback));
        if first && self.client.is_connected() {
            if let Err(e) = self.subscribe_silent(node).await {
                warn!(target: "PubSub", "Failed to subscribe '{node}': {e}");
            }
        }
        id
    }

    /// Drops a callback. Removing the last one unsubscribes from the node.
    pub async fn remove(&self, node: &str, id: SubscriptionId) {
        let last = lock(&self.state).remove(node, id);
        if last && self.client.is_connected() {
            self.unsubscribe_silent(node).await;
        }
    }

    /// Subscribes and returns the node state from the reply.
    pub async fn subscribe(&self, node: &str) -> Result<Vec<PubSubNode>, ClientError> {
        subscribe_node(&self.client, &self.state, node, false).await
    }

    /// Subscribes with `silent="yes"`.
    pub async fn subscribe_silent(&self, node: &str) -> Result<Vec<PubSubNode>, ClientError> {
        subscribe_node(&self.client, &self.state, node, true).await
    }

    pub async fn unsubscribe(&self, node: &str) -> Result<Stanza, ClientError> {
        Ok(self
            .client
            .send_iq(subscribe_query(node, false, false))
            .await?)
    }

    pub async fn unsubscribe_silent(&self, node: &str) {
        if let Err(e) = self.unsubscribe(node).await {
            warn!(target: "PubSub", "Failed to unsubscribe '{node}': {e}");
        }
    }

    /// Node names the server holds subscriptions for.
    pub async fn subscriptions(&self) -> Result<Vec<String>, ClientError> {
        let reply = self
            .client
            .send_iq(InfoQuery::get(NS_PUB_SUBSCRIBE))
            .await?;
        Ok(reply
            .descendants("node")
            .into_iter()
            .filter_map(|n| n.attr("name"))
            .map(str::to_string)
            .collect())
    }

    pub async fn store(&self, node: &str, id: &str, data: &str) -> Result<Stanza, ClientError> {
        let item = StanzaBuilder::new("item")
            .attr("node", node)
            .attr("id", id)
            .text(data)
            .build();
        let query = InfoQuery::set(NS_PUB).attr("action", "store").child(item);
        Ok(self.client.send_iq(query).await?)
    }

    pub async fn clear(&self, node: &str, id: &str) -> Result<Stanza, ClientError> {
        let item = StanzaBuilder::new("item")
            .attr("node", node)
            .attr("id", id)
            .build();
        let query = InfoQuery::set(NS_PUB).attr("action", "clear").child(item);
        Ok(self.client.send_iq(query).await?)
    }

    /// Runs a server-side procedure; `data` travels as the query text.
    pub async fn execute(&self, id: &str, data: Option<&str>) -> Result<Stanza, ClientError> {
        let mut query = StanzaBuilder::new("query")
            .attr("xmlns", NS_PUB_EXECUTE)
            .attr("id", id);
        if let Some(data) = data {
            query = query.text(data);
        }
        let iq = StanzaBuilder::new("iq")
            .attr("type", "get")
            .child(query.build())
            .build();
        Ok(self.client.send_request(iq).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn node(name: &str, items: &[(&str, &str)]) -> PubSubNode {
        PubSubNode::new(
            name,
            items
                .iter()
                .map(|(id, data)| PubSubItem::new(*id, *data, None))
                .collect(),
        )
    }

    fn names(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(Event::name).collect()
    }

    #[test]
    fn test_silent_store_merges_without_events() {
        let mut state = PubSubState::default();
        let (merged, events) = state.store(vec![node("status", &[("a", "1"), ("b", "2")])], true);
        assert!(events.is_empty());
        assert_eq!(merged[0].items.len(), 2);

        let (_, events) = state.store(vec![node("status", &[("b", "3"), ("c", "4")])], false);
        assert_eq!(names(&events), vec!["node_stored", "node_stored"]);
        let ids: Vec<_> = state
            .node("status")
            .unwrap()
            .items
            .iter()
            .map(|i| (i.id.as_str(), i.data.as_str()))
            .collect();
        assert_eq!(ids, vec![("a", "1"), ("b", "3"), ("c", "4")]);
    }

    #[test]
    fn test_clear_reports_only_removed_items() {
        let mut state = PubSubState::default();
        state.store(vec![node("status", &[("a", "1")])], true);

        let events = state.clear(&[node("status", &[("a", ""), ("zz", "")])]);
        assert_eq!(names(&events), vec!["node_cleared"]);
        assert!(state.clear(&[node("unknown", &[("a", "")])]).is_empty());
        assert!(state.node("status").unwrap().items.is_empty());
    }

    #[test]
    fn test_broadcast_reaches_subscribers_and_is_not_stored() {
        let mut state = PubSubState::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        assert!(state.add(
            "chat",
            SubscriptionId(1),
            Arc::new(move |_: &PubSubItem| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        ));

        let deliveries = state.broadcast(vec![node("chat", &[("m1", "hi"), ("m2", "yo")])]);
        assert_eq!(deliveries.len(), 2);
        for (event, callbacks) in &deliveries {
            if let Event::NodeBroadcast(delivery) = event {
                run_callbacks(callbacks, &delivery.item);
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(state.node("chat").is_none());
    }

    #[test]
    fn test_last_remove_drops_subscription() {
        let mut state = PubSubState::default();
        let noop: NodeCallback = Arc::new(|_: &PubSubItem| {});
        assert!(state.add("chat", SubscriptionId(1), noop.clone()));
        assert!(!state.add("chat", SubscriptionId(2), noop));

        assert!(!state.remove("chat", SubscriptionId(1)));
        assert!(!state.remove("chat", SubscriptionId(9)));
        assert!(state.remove("chat", SubscriptionId(2)));
        assert!(state.subscribed_nodes().is_empty());
    }

    #[test]
    fn test_teardown_clears_every_item() {
        let mut state = PubSubState::default();
        state.store(
            vec![node("a", &[("1", ""), ("2", "")]), node("b", &[("3", "")])],
            true,
        );
        let events = state.teardown();
        assert_eq!(names(&events), vec!["node_cleared"; 3]);
        assert!(state.nodes().is_empty());
    }

    #[test]
    fn test_pub_event_body() {
        let event = StanzaBuilder::new("event")
            .attr("xmlns", NS_PUB)
            .attr("type", "user_change")
            .text(r#"{"id": 7}"#)
            .build();
        let parsed = parse_pub_event(&event).unwrap();
        assert_eq!(parsed.kind, "user_change");
        assert_eq!(parsed.data["id"], 7);

        let broken = StanzaBuilder::new("event").attr("type", "x").text("{").build();
        assert!(parse_pub_event(&broken).is_none());
    }
}
