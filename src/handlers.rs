use crate::client::Client;
use async_trait::async_trait;
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Processes inbound stanzas of one kind.
///
/// Handlers run on the client driver, one stanza at a time, so they must not
/// await a request reply themselves: replies arrive through the same driver.
/// Spawn a task for anything that needs a round trip.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    /// Returns `true` when the stanza was consumed and lower-ranked handlers
    /// should not see it.
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool;
}

/// Session lifecycle hooks for feature modules.
///
/// `on_disconnected` runs before the public `Disconnected` event, so modules
/// finish tearing down their state before any application listener observes
/// the session loss.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_connected(&self, _client: &Arc<Client>) {}

    async fn on_disconnected(&self, _client: &Arc<Client>, _error: Option<&TransportError>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registered {
    id: HandlerId,
    kind: StanzaKind,
    priority: i32,
    handler: Arc<dyn StanzaHandler>,
}

/// Handlers per stanza kind, ordered by ascending priority. Equal ranks keep
/// registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registered>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: StanzaKind,
        priority: i32,
        handler: Arc<dyn StanzaHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = handlers.partition_point(|h| h.priority <= priority);
        handlers.insert(
            index,
            Registered {
                id,
                kind,
                priority,
                handler,
            },
        );
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offers the stanza to each handler of its kind until one consumes it.
    pub async fn dispatch(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        let Some(kind) = stanza.kind() else {
            return false;
        };
        let candidates: Vec<Arc<dyn StanzaHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.kind == kind)
            .map(|h| h.handler.clone())
            .collect();

        for handler in candidates {
            if handler.handle(client, stanza).await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransportFactory;
    use sbcore::stanza::StanzaBuilder;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        consume: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StanzaHandler for Recording {
        async fn handle(&self, _client: &Arc<Client>, _stanza: &Stanza) -> bool {
            self.log.lock().unwrap().push(self.name);
            self.consume
        }
    }

    fn recording(
        name: &'static str,
        consume: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn StanzaHandler> {
        Arc::new(Recording {
            name,
            consume,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_follows_priority_and_stops_at_first_consumer() {
        let client = Client::new(ClientConfig::default(), Arc::new(MockTransportFactory::new()));
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(StanzaKind::Message, 100, recording("pubsub", true, &log));
        registry.register(StanzaKind::Message, 10, recording("calls", false, &log));
        registry.register(StanzaKind::Message, 10, recording("queues", true, &log));
        registry.register(StanzaKind::Presence, 1, recording("contacts", true, &log));

        let message = StanzaBuilder::new("message").build();
        assert!(registry.dispatch(&client, &message).await);
        assert_eq!(*log.lock().unwrap(), vec!["calls", "queues"]);
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let client = Client::new(ClientConfig::default(), Arc::new(MockTransportFactory::new()));
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = registry.register(StanzaKind::Iq, 10, recording("calls", true, &log));
        assert_eq!(registry.handler_count(), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));

        let iq = StanzaBuilder::new("iq").attr("type", "get").build();
        assert!(!registry.dispatch(&client, &iq).await);
        assert!(log.lock().unwrap().is_empty());
    }
}
