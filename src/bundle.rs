use crate::client::Client;
use crate::config::ClientConfig;
use crate::events::{DeferredHandler, EventCallback, event_callback};
use crate::features::{Calls, Conferences, Contacts, Conversations, PubSub, Queues};
use crate::transport::TransportFactory;
use anyhow::Result;
use log::info;
use sbcore::resource::{PassiveFactory, ResourceFactory};
use sbcore::types::events::Event;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A client with every feature module attached to it.
pub struct Switchboard {
    pub client: Arc<Client>,
    pub calls: Calls,
    pub queues: Queues,
    pub contacts: Contacts,
    pub pubsub: PubSub,
    pub conferences: Conferences,
    pub conversations: Conversations,
    event_callbacks: Vec<EventCallback>,
}

impl Switchboard {
    pub fn builder() -> SwitchboardBuilder {
        SwitchboardBuilder::new()
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    /// Attaches the `on_event` callbacks, starts the driver and connects.
    pub async fn run(&mut self) -> JoinHandle<()> {
        for callback in self.event_callbacks.drain(..) {
            let (handler, _worker) = DeferredHandler::spawn(&self.client, callback);
            self.client.add_event_handler(Arc::new(handler));
        }

        let handle = self.client.start();
        self.client.connect().await;
        handle
    }
}

#[derive(Default)]
pub struct SwitchboardBuilder {
    config: Option<ClientConfig>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    resource_factory: Option<Arc<dyn ResourceFactory>>,
    event_callbacks: Vec<EventCallback>,
}

impl SwitchboardBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Handlers for resources other participants share into calls. Defaults
    /// to handlers that ignore all resource traffic.
    pub fn with_resource_factory(mut self, factory: Arc<dyn ResourceFactory>) -> Self {
        self.resource_factory = Some(factory);
        self
    }

    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Event, Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_callbacks.push(event_callback(handler));
        self
    }

    pub fn build(self) -> Result<Switchboard> {
        let config = self.config.unwrap_or_default();
        let transport_factory = self
            .transport_factory
            .ok_or_else(|| anyhow::anyhow!("A transport factory is required"))?;
        let resource_factory = self
            .resource_factory
            .unwrap_or_else(|| Arc::new(PassiveFactory));

        info!(target: "Switchboard", "Building client for {}@{}", config.uid, config.realm);
        let client = Client::new(config, transport_factory);
        let calls = Calls::new(client.clone(), resource_factory);
        let queues = Queues::new(client.clone());
        let contacts = Contacts::new(client.clone());
        let pubsub = PubSub::new(client.clone());
        let conferences = Conferences::new(client.clone());
        let conversations = Conversations::new(client.clone());

        Ok(Switchboard {
            client,
            calls,
            queues,
            contacts,
            pubsub,
            conferences,
            conversations,
            event_callbacks: self.event_callbacks,
        })
    }
}
