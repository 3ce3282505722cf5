//! Call-center queues and the calls waiting in them.

use crate::client::{Client, ClientError};
use crate::handlers::{SessionListener, StanzaHandler};
use crate::request::InfoQuery;
use async_trait::async_trait;
use log::{debug, info};
use sbcore::collection::{Entity, EntityCollection};
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaKind};
use sbcore::types::events::{Event, QueueCallEvent};
use sbcore::types::queue::{Queue, QueueCall, RawQueue, RawQueueCall};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const NS_CC: &str = "urn:switchboard:cc";
pub const NS_CC_CALL: &str = "urn:switchboard:cc:call";

pub(crate) const PRIORITY: i32 = 10;

#[derive(Debug, Default)]
pub struct QueuesState {
    queues: EntityCollection<Queue>,
    subscribed: bool,
}

impl QueuesState {
    pub fn queues(&self) -> Vec<Queue> {
        self.queues.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Queue> {
        self.queues.get(id)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Installs the queue list returned by a subscribe.
    pub fn replace(&mut self, items: Vec<RawQueue>) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .queues
            .drain()
            .into_iter()
            .map(Event::QueueDeleted)
            .collect();
        let added = self.queues.apply_create(items);
        events.extend(
            added
                .iter()
                .filter_map(|id| self.queues.get(id))
                .map(|queue| Event::QueueAdded(queue.clone())),
        );
        self.subscribed = true;
        events
    }

    /// Applies a queue or queue-call event. Returns `None` for foreign traffic.
    pub fn on_message(&mut self, message: &Stanza) -> Option<Vec<Event>> {
        if let Some(event) = message.get_child_ns("event", NS_CC) {
            return Some(self.apply_queues(event.attr("type"), RawQueue::parse_all(event)));
        }
        if let Some(event) = message.get_child_ns("event", NS_CC_CALL) {
            let queue = event.attr("queue").unwrap_or_default();
            return Some(self.apply_queue_calls(
                event.attr("type"),
                queue,
                RawQueueCall::parse_all(event),
            ));
        }
        None
    }

    fn apply_queues(&mut self, kind: Option<&str>, items: Vec<RawQueue>) -> Vec<Event> {
        match kind {
            Some("create") => {
                let added = self.queues.apply_create(items);
                added
                    .iter()
                    .filter_map(|id| self.queues.get(id))
                    .map(|queue| Event::QueueAdded(queue.clone()))
                    .collect()
            }
            Some("update") => self
                .queues
                .apply_update_with(items, |queue, raw| {
                    queue.update_from_raw(raw);
                    Event::QueueUpdated(queue.clone())
                }),
            Some("delete") => self
                .queues
                .apply_delete(items)
                .into_iter()
                .map(|(queue, _)| Event::QueueDeleted(queue))
                .collect(),
            other => {
                debug!(target: "Queues", "Ignoring queue event of type {other:?}");
                Vec::new()
            }
        }
    }

    fn apply_queue_calls(
        &mut self,
        kind: Option<&str>,
        queue_id: &str,
        items: Vec<RawQueueCall>,
    ) -> Vec<Event> {
        let Some(queue) = self.queues.get_mut(queue_id) else {
            debug!(target: "Queues", "Call event for unknown queue '{queue_id}'");
            return Vec::new();
        };
        let wrap = |call: QueueCall| QueueCallEvent {
            queue: queue_id.to_string(),
            call,
        };

        match kind {
            Some("create") => {
                let added = queue.calls.apply_create(items);
                added
                    .iter()
                    .filter_map(|id| queue.calls.get(id))
                    .map(|call| Event::QueueCallAdded(wrap(call.clone())))
                    .collect()
            }
            Some("update") => queue.calls.apply_update_with(items, |call, raw| {
                call.update_from_raw(raw);
                Event::QueueCallUpdated(wrap(call.clone()))
            }),
            Some("delete") => queue
                .calls
                .apply_delete(items)
                .into_iter()
                .map(|(call, _)| Event::QueueCallDeleted(wrap(call)))
                .collect(),
            other => {
                debug!(target: "Queues", "Ignoring queue call event of type {other:?}");
                Vec::new()
            }
        }
    }

    pub fn teardown(&mut self) -> Vec<Event> {
        self.subscribed = false;
        self.queues
            .drain()
            .into_iter()
            .map(Event::QueueDeleted)
            .collect()
    }
}

struct QueuesHandler {
    state: Arc<Mutex<QueuesState>>,
}

impl QueuesHandler {
    fn lock(&self) -> MutexGuard<'_, QueuesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StanzaHandler for QueuesHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        let events = self.lock().on_message(stanza);
        match events {
            Some(events) => {
                events.into_iter().for_each(|e| client.dispatch_event(e));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionListener for QueuesHandler {
    async fn on_disconnected(&self, client: &Arc<Client>, _error: Option<&TransportError>) {
        let events = self.lock().teardown();
        events.into_iter().for_each(|e| client.dispatch_event(e));
    }
}

#[derive(Clone)]
pub struct Queues {
    client: Arc<Client>,
    state: Arc<Mutex<QueuesState>>,
}

impl Queues {
    pub fn new(client: Arc<Client>) -> Self {
        let state = Arc::new(Mutex::new(QueuesState::default()));
        let handler = Arc::new(QueuesHandler {
            state: state.clone(),
        });
        client.register_handler(StanzaKind::Message, PRIORITY, handler.clone());
        client.add_session_listener(handler);
        Self { client, state }
    }

    fn lock(&self) -> MutexGuard<'_, QueuesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queues(&self) -> Vec<Queue> {
        self.lock().queues()
    }

    pub fn queue(&self, id: &str) -> Option<Queue> {
        self.lock().get(id).cloned()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().is_subscribed()
    }

    /// Subscribes to queue events. The reply carries the full queue list,
    /// which replaces whatever is held locally.
    pub async fn subscribe(&self) -> Result<Vec<Queue>, ClientError> {
        let reply = self.client.send_iq(InfoQuery::set(NS_CC)).await?;
        let items = reply.query().map(RawQueue::parse_all).unwrap_or_default();
        let events = self.lock().replace(items);
        info!(target: "Queues", "Subscribed, {} queues", self.lock().queues.len());
        events
            .into_iter()
            .for_each(|e| self.client.dispatch_event(e));
        Ok(self.queues())
    }
}
