use crate::config::ClientConfig;
use crate::handlers::{HandlerId, HandlerRegistry, SessionListener, StanzaHandler};
use crate::request::RequestError;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use sbcore::identity::{Identity, make_unique_id};
use sbcore::session::{
    ConnectParams, SessionAction, SessionMachine, SessionStatus, TransportError,
};
use sbcore::stanza::{Stanza, StanzaBuilder, StanzaKind};
use sbcore::types::events::{Connected, CoreEventBus, Disconnected, Event, EventHandler};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    #[error("unknown call '{0}'")]
    UnknownCall(String),
    #[error("unknown resource '{id}' in call '{call}'")]
    UnknownResource { call: String, id: String },
    #[error("call '{0}' has no meet key")]
    NoMeet(String),
    #[error("resource '{id}' is already shared in call '{call}'")]
    AlreadyShared { call: String, id: String },
    #[error("unknown conference '{0}'")]
    UnknownConference(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

type ResponseWaiter = oneshot::Sender<Result<Stanza, RequestError>>;

pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,

    session: Mutex<SessionMachine>,
    transport_factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<(u64, Arc<dyn Transport>)>>,
    inbound_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, TransportEvent)>>>,

    pub(crate) response_waiters: DashMap<String, ResponseWaiter>,
    handlers: HandlerRegistry,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    event_bus: CoreEventBus,

    is_connected: AtomicBool,
    is_connecting: AtomicBool,
    is_running: AtomicBool,
    shutdown_notifier: Notify,
}

impl Client {
    pub fn new(config: ClientConfig, transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let identity = config.identity();
        let unique_id = make_unique_id(&config.uid, &config.password, &config.resource_prefix);
        let session = SessionMachine::new(identity, &config.endpoint, config.reconnect.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            unique_id,
            id_counter: AtomicU64::new(0),
            session: Mutex::new(session),
            transport_factory,
            transport: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            response_waiters: DashMap::new(),
            handlers: HandlerRegistry::new(),
            listeners: RwLock::new(Vec::new()),
            event_bus: CoreEventBus::new(),
            is_connected: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bare address of the account.
    pub fn jid(&self) -> String {
        format!("{}@{}", self.config.uid, self.config.realm)
    }

    /// Current identity, including the negotiated resource.
    pub async fn identity(&self) -> Identity {
        self.session.lock().await.identity().clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn event_bus(&self) -> &CoreEventBus {
        &self.event_bus
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.add_handler(handler);
    }

    pub(crate) fn dispatch_event(&self, event: Event) {
        self.event_bus.dispatch(&event);
    }

    pub fn register_handler(
        &self,
        kind: StanzaKind,
        priority: i32,
        handler: Arc<dyn StanzaHandler>,
    ) -> HandlerId {
        self.handlers.register(kind, priority, handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// The driver loop: transport events and liveness ticks are handled here,
    /// one at a time, until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "Client `run` called while already running.");
            return;
        }
        let Some(mut inbound) = self.inbound_rx.lock().await.take() else {
            error!(target: "Client", "Inbound event queue is gone, cannot run.");
            self.is_running.store(false, Ordering::SeqCst);
            return;
        };

        let mut ticker = tokio::time::interval(self.config.reconnect.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "Client", "Client driver started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Client", "Shutdown signaled, stopping driver.");
                    break;
                }
                Some((attempt, event)) = inbound.recv() => {
                    self.handle_transport_event(attempt, event).await;
                }
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
            }
        }

        *self.inbound_rx.lock().await = Some(inbound);
        self.is_running.store(false, Ordering::SeqCst);
        info!(target: "Client", "Client driver has shut down.");
    }

    /// Arms auto-reconnect and opens the first transport.
    pub async fn connect(self: &Arc<Self>) {
        self.apply(|session| session.connect(None)).await;
    }

    pub async fn connect_to(self: &Arc<Self>, endpoint: &str) {
        self.apply(|session| session.connect(Some(endpoint))).await;
    }

    /// Drops a live session, if any, and connects to `endpoint`.
    pub async fn reconnect(self: &Arc<Self>, endpoint: &str) {
        self.apply(|session| session.reconnect(endpoint)).await;
    }

    /// Ends the session and disarms auto-reconnect.
    pub async fn disconnect(self: &Arc<Self>) {
        info!(target: "Client", "Disconnecting client intentionally.");
        self.apply(SessionMachine::disconnect).await;
    }

    /// Disconnects and stops the driver loop.
    pub async fn shutdown(self: &Arc<Self>) {
        self.disconnect().await;
        self.shutdown_notifier.notify_one();
    }

    pub async fn send(&self, stanza: &Stanza) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let transport = self
            .transport
            .lock()
            .await
            .as_ref()
            .map(|(_, t)| t.clone())
            .ok_or(ClientError::NotConnected)?;
        debug!(target: "Client/Send", "{stanza}");
        transport.send(stanza).await?;
        Ok(())
    }

    async fn apply(
        self: &Arc<Self>,
        step: impl FnOnce(&mut SessionMachine) -> Vec<SessionAction>,
    ) {
        let actions = {
            let mut session = self.session.lock().await;
            step(&mut session)
        };
        self.execute(actions).await;
    }

    async fn execute(self: &Arc<Self>, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Connect(params) => {
                    let client = self.clone();
                    tokio::spawn(async move { client.open_transport(params).await });
                }
                SessionAction::Disconnect { attempt } => self.close_transport(attempt).await,
                SessionAction::EmitConnected => self.on_session_connected().await,
                SessionAction::EmitDisconnected { error } => {
                    self.on_session_disconnected(error).await
                }
            }
        }
    }

    async fn handle_tick(self: &Arc<Self>) {
        let activity = self
            .transport
            .lock()
            .await
            .as_ref()
            .and_then(|(_, t)| t.activity());
        let now = Utc::now().timestamp();
        self.apply(|session| session.tick(now, activity)).await;
    }

    async fn handle_transport_event(self: &Arc<Self>, attempt: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let now = Utc::now().timestamp();
                self.apply(|session| session.handle_connected(attempt, now))
                    .await;
            }
            TransportEvent::Error(error) => {
                self.apply(|session| session.handle_error(attempt, error))
                    .await;
            }
            TransportEvent::Disconnected => {
                self.apply(|session| session.handle_disconnected(attempt))
                    .await;
            }
            TransportEvent::Stanza(stanza) => {
                if !self.session.lock().await.accepts(attempt) {
                    debug!(
                        target: "Client/Recv",
                        "Dropping stanza outside a live session (attempt {attempt})"
                    );
                    return;
                }
                self.process_stanza(stanza).await;
            }
        }
    }

    async fn process_stanza(self: &Arc<Self>, stanza: Stanza) {
        debug!(target: "Client/Recv", "{stanza}");
        if self.handle_response(&stanza) {
            return;
        }
        if self.handlers.dispatch(self, &stanza).await {
            return;
        }

        let unanswered_request = stanza.kind() == Some(StanzaKind::Iq)
            && matches!(stanza.stanza_type(), Some("get") | Some("set"));
        if unanswered_request {
            let reply = stanza.error_reply(501, "cancel", "feature-not-implemented");
            if let Err(e) = self.send(&reply).await {
                warn!(target: "Client/Recv", "Failed to reject unhandled iq: {e}");
            }
        } else {
            debug!(target: "Client/Recv", "Unhandled <{}> stanza", stanza.tag);
        }
    }

    async fn open_transport(self: Arc<Self>, params: ConnectParams) {
        let attempt = params.attempt;
        self.is_connecting.store(true, Ordering::SeqCst);
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        info!(target: "Client", "Opening transport to {} (attempt {attempt})", params.endpoint);
        let (transport, mut events) = match self.transport_factory.create_transport(&params).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(target: "Client", "Failed to open transport: {e:#}");
                let _ = self
                    .inbound_tx
                    .send((attempt, TransportEvent::Error(TransportError::from(e))));
                return;
            }
        };

        let accepted = {
            let mut slot = self.transport.lock().await;
            let session = self.session.lock().await;
            if session.attempt() == attempt && session.status() == SessionStatus::Connecting {
                Some(slot.replace((attempt, transport.clone())).map(|(_, previous)| previous))
            } else {
                None
            }
        };
        let Some(previous) = accepted else {
            debug!(target: "Client", "Attempt {attempt} was superseded while opening");
            transport.disconnect().await;
            return;
        };
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut closed = false;
            while let Some(event) = events.recv().await {
                closed |= matches!(event, TransportEvent::Disconnected);
                if tx.send((attempt, event)).is_err() {
                    return;
                }
            }
            if !closed {
                let _ = tx.send((attempt, TransportEvent::Disconnected));
            }
        });
    }

    async fn close_transport(&self, attempt: u64) {
        let transport = {
            let mut slot = self.transport.lock().await;
            match slot.as_ref() {
                Some((current, _)) if *current == attempt => slot.take().map(|(_, t)| t),
                _ => None,
            }
        };
        if let Some(transport) = transport {
            debug!(target: "Client", "Closing transport of attempt {attempt}");
            transport.disconnect().await;
        }
    }

    async fn on_session_connected(self: &Arc<Self>) {
        self.is_connected.store(true, Ordering::SeqCst);

        if !self.config.silent {
            let presence = StanzaBuilder::new("presence").build();
            if let Err(e) = self.send(&presence).await {
                warn!(target: "Client", "Failed to send initial presence: {e}");
            }
        }

        for listener in self.session_listeners() {
            listener.on_connected(self).await;
        }
        self.dispatch_event(Event::Connected(Connected));
    }

    async fn on_session_disconnected(self: &Arc<Self>, error: Option<TransportError>) {
        self.is_connected.store(false, Ordering::SeqCst);
        self.fail_pending_requests();

        for listener in self.session_listeners() {
            listener.on_disconnected(self, error.as_ref()).await;
        }
        self.dispatch_event(Event::Disconnected(Disconnected::from_error(
            error.as_ref(),
        )));
    }

    fn session_listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
