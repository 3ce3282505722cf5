use async_trait::async_trait;
use sbcore::session::ConnectParams;
use sbcore::stanza::Stanza;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use sbcore::session::TransportError;

/// What a transport reports back to the client driver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The stream is authenticated and ready for stanzas.
    Connected,
    Stanza(Stanza),
    Error(TransportError),
    /// The stream closed. Sent once per transport.
    Disconnected,
}

/// One live stream to the server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, stanza: &Stanza) -> Result<(), anyhow::Error>;

    async fn disconnect(&self);

    /// Monotonic count of inbound traffic, if the transport tracks it. The
    /// liveness check treats an unchanged count as silence.
    fn activity(&self) -> Option<u64> {
        None
    }
}

/// Opens transports, one per connect attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        params: &ConnectParams,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// Scripted in-memory transport for driving a client without a network.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records every stanza the client sends.
    #[derive(Default)]
    pub struct MockTransport {
        sent: Mutex<Vec<Stanza>>,
        sent_notify: Notify,
        activity: AtomicU64,
        closed: AtomicBool,
    }

    impl MockTransport {
        pub fn sent(&self) -> Vec<Stanza> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn bump_activity(&self) {
            self.activity.fetch_add(1, Ordering::SeqCst);
        }

        /// Waits until a stanza matching `predicate` has been sent and
        /// returns it.
        pub async fn wait_for_sent(
            &self,
            predicate: impl Fn(&Stanza) -> bool,
            within: Duration,
        ) -> Option<Stanza> {
            let wait = async {
                loop {
                    let notified = self.sent_notify.notified();
                    if let Some(found) = self.sent().into_iter().find(|s| predicate(s)) {
                        return found;
                    }
                    notified.await;
                }
            };
            tokio::time::timeout(within, wait).await.ok()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, stanza: &Stanza) -> Result<(), anyhow::Error> {
            if self.is_closed() {
                return Err(anyhow::anyhow!("mock transport is closed"));
            }
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(stanza.clone());
            self.sent_notify.notify_waiters();
            Ok(())
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn activity(&self) -> Option<u64> {
            Some(self.activity.load(Ordering::SeqCst))
        }
    }

    /// One attempt opened through [`MockTransportFactory`].
    #[derive(Clone)]
    pub struct MockConnection {
        pub params: ConnectParams,
        pub transport: Arc<MockTransport>,
        pub events: mpsc::Sender<TransportEvent>,
    }

    impl MockConnection {
        /// Pushes a transport event into the client. Errors are ignored once
        /// the client has dropped the attempt.
        pub async fn emit(&self, event: TransportEvent) {
            let _ = self.events.send(event).await;
        }

        pub async fn deliver(&self, stanza: Stanza) {
            self.emit(TransportEvent::Stanza(stanza)).await;
        }
    }

    /// Hands out [`MockTransport`]s and keeps a handle to each one so tests
    /// can inject server traffic.
    #[derive(Default)]
    pub struct MockTransportFactory {
        connections: Mutex<Vec<MockConnection>>,
        opened: Notify,
        auto_connect: bool,
        refuse: AtomicBool,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every new transport reports `Connected` right away.
        pub fn auto_connect() -> Self {
            Self {
                auto_connect: true,
                ..Self::default()
            }
        }

        /// Makes subsequent attempts fail at creation.
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        pub fn connections(&self) -> Vec<MockConnection> {
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn connection_count(&self) -> usize {
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        /// Waits until at least `count` transports have been opened and
        /// returns the most recent one.
        pub async fn wait_for_connection(
            &self,
            count: usize,
            within: Duration,
        ) -> Option<MockConnection> {
            let wait = async {
                loop {
                    let notified = self.opened.notified();
                    let connections = self.connections();
                    if connections.len() >= count {
                        if let Some(last) = connections.last() {
                            return last.clone();
                        }
                    }
                    notified.await;
                }
            };
            tokio::time::timeout(within, wait).await.ok()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            params: &ConnectParams,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("connection refused by mock"));
            }
            let (tx, rx) = mpsc::channel(64);
            let transport = Arc::new(MockTransport::default());
            if self.auto_connect {
                let _ = tx.send(TransportEvent::Connected).await;
            }
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(MockConnection {
                    params: params.clone(),
                    transport: transport.clone(),
                    events: tx,
                });
            self.opened.notify_waiters();
            Ok((transport, rx))
        }
    }
}
