use crate::client::Client;
use log::{debug, error};
use sbcore::types::events::{Event, EventHandler};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type EventCallback =
    Arc<dyn Fn(Event, Arc<Client>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps an async closure into an [`EventCallback`].
pub fn event_callback<F, Fut>(handler: F) -> EventCallback
where
    F: Fn(Event, Arc<Client>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event, client| Box::pin(handler(event, client)))
}

/// Event bus handler that runs an async callback off the emitting thread.
///
/// Events are queued and handed to the callback one at a time, in emission
/// order. Each invocation runs in its own task, so a panicking callback is
/// logged and the queue moves on.
pub struct DeferredHandler {
    tx: mpsc::UnboundedSender<Event>,
}

impl DeferredHandler {
    /// Starts the delivery task. It ends once the client is dropped.
    pub fn spawn(client: &Arc<Client>, callback: EventCallback) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(deliver(Arc::downgrade(client), callback, rx));
        (Self { tx }, worker)
    }
}

async fn deliver(
    client: Weak<Client>,
    callback: EventCallback,
    mut rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = rx.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        let name = event.name();
        if let Err(e) = tokio::spawn(callback(event, client)).await {
            if e.is_panic() {
                error!(target: "Events", "Event callback panicked on {name}");
            }
        }
    }
    debug!(target: "Events", "Deferred event delivery stopped");
}

impl EventHandler for DeferredHandler {
    fn handle_event(&self, event: &Event) {
        if self.tx.send(event.clone()).is_err() {
            debug!(target: "Events", "Dropping {}: delivery task is gone", event.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransportFactory;
    use sbcore::types::events::{Connected, Disconnected};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_deferred_delivery_keeps_order_and_survives_panics() {
        let client = Client::new(ClientConfig::default(), Arc::new(MockTransportFactory::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let sink = seen.clone();
        let callback = event_callback(move |event: Event, _client| {
            let sink = sink.clone();
            let done_tx = done_tx.clone();
            async move {
                if let Event::Disconnected(d) = &event {
                    if d.error.as_deref() == Some("boom") {
                        panic!("callback bug");
                    }
                }
                sink.lock().unwrap().push(event.name());
                let _ = done_tx.send(());
            }
        });
        let (handler, _worker) = DeferredHandler::spawn(&client, callback);
        client.add_event_handler(Arc::new(handler));

        client.event_bus().dispatch(&Event::Connected(Connected));
        client.event_bus().dispatch(&Event::Disconnected(Disconnected {
            error: Some("boom".to_string()),
        }));
        client.event_bus().dispatch(&Event::Disconnected(Disconnected { error: None }));

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["connected", "disconnected"]);
    }
}
