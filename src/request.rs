use crate::client::Client;
use log::{debug, warn};
use sbcore::stanza::{Stanza, StanzaBuilder};
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Set,
    Get,
}

impl InfoQueryType {
    fn as_str(&self) -> &'static str {
        match self {
            InfoQueryType::Set => "set",
            InfoQueryType::Get => "get",
        }
    }
}

/// An iq request with a single `<query xmlns/>` payload.
#[derive(Debug, Clone)]
pub struct InfoQuery {
    pub namespace: String,
    pub query_type: InfoQueryType,
    pub to: Option<String>,
    pub query_attrs: Vec<(String, String)>,
    pub children: Vec<Stanza>,
    pub timeout: Option<Duration>,
}

impl InfoQuery {
    pub fn set(namespace: &str) -> Self {
        Self::new(namespace, InfoQueryType::Set)
    }

    pub fn get(namespace: &str) -> Self {
        Self::new(namespace, InfoQueryType::Get)
    }

    fn new(namespace: &str, query_type: InfoQueryType) -> Self {
        Self {
            namespace: namespace.to_string(),
            query_type,
            to: None,
            query_attrs: Vec::new(),
            children: Vec::new(),
            timeout: None,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_attrs.push((key.into(), value.into()));
        self
    }

    pub fn child(mut self, child: Stanza) -> Self {
        self.children.push(child);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn into_stanza(self) -> Stanza {
        let query = StanzaBuilder::new("query")
            .attr("xmlns", self.namespace)
            .attrs(self.query_attrs)
            .children(self.children)
            .build();
        let mut iq = StanzaBuilder::new("iq").attr("type", self.query_type.as_str());
        if let Some(to) = self.to {
            iq = iq.attr("to", to);
        }
        iq.child(query).build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("client is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session was lost before the reply arrived")]
    Disconnected,
    #[error("server error {code}: {reason}")]
    Server { code: u16, reason: String },
    #[error("internal channel closed unexpectedly")]
    InternalChannelClosed,
}

impl RequestError {
    /// Reads `<error code><condition/></error>` from an error reply.
    pub fn from_error_reply(reply: &Stanza) -> Self {
        let Some(error) = reply.get_optional_child("error") else {
            return RequestError::Server {
                code: 0,
                reason: "unknown".to_string(),
            };
        };
        let mut parser = error.attrs();
        let code = parser
            .optional_u64("code")
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(0);
        if !parser.ok() {
            warn!(target: "Client/Request", "Malformed error code in reply: {:?}", parser.errors);
        }
        let reason = error
            .children()
            .first()
            .map(|c| c.tag.clone())
            .unwrap_or_else(|| "unknown".to_string());
        RequestError::Server { code, reason }
    }
}

impl Client {
    pub fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    pub async fn send_iq(&self, query: InfoQuery) -> Result<Stanza, RequestError> {
        let within = query.timeout;
        let stanza = query.into_stanza();
        match within {
            Some(within) => self.send_request_timeout(stanza, within).await,
            None => self.send_request(stanza).await,
        }
    }

    /// Sends a request stanza and waits for the `result` or `error` reply with
    /// the same id. An id is assigned when the stanza has none.
    pub async fn send_request(&self, stanza: Stanza) -> Result<Stanza, RequestError> {
        self.send_request_timeout(stanza, self.config.request_timeout())
            .await
    }

    pub async fn send_request_timeout(
        &self,
        mut stanza: Stanza,
        within: Duration,
    ) -> Result<Stanza, RequestError> {
        let req_id = match stanza.id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.generate_request_id();
                stanza.attrs.insert("id".to_string(), id.clone());
                id
            }
        };

        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.response_waiters.insert(req_id.clone(), tx);

        if let Err(e) = self.send(&stanza).await {
            self.response_waiters.remove(&req_id);
            return Err(RequestError::Transport(e.to_string()));
        }

        match timeout(within, rx).await {
            Ok(Ok(Ok(reply))) => {
                if reply.stanza_type() == Some("error") {
                    return Err(RequestError::from_error_reply(&reply));
                }
                Ok(reply)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RequestError::InternalChannelClosed),
            Err(_) => {
                self.response_waiters.remove(&req_id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Hands a `result`/`error` reply to its waiter. Returns `false` when no
    /// request is waiting for it.
    pub(crate) fn handle_response(&self, stanza: &Stanza) -> bool {
        if !matches!(stanza.stanza_type(), Some("result") | Some("error")) {
            return false;
        }
        let Some(id) = stanza.id() else {
            return false;
        };
        if let Some((_, waiter)) = self.response_waiters.remove(id) {
            if waiter.send(Ok(stanza.clone())).is_err() {
                warn!(target: "Client/Request", "Waiter for {id} dropped before the reply arrived");
            }
            return true;
        }
        false
    }

    /// Fails every outstanding request; their replies can no longer arrive.
    pub(crate) fn fail_pending_requests(&self) {
        let ids: Vec<String> = self
            .response_waiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if !ids.is_empty() {
            debug!(target: "Client/Request", "Failing {} pending requests", ids.len());
        }
        for id in ids {
            if let Some((_, waiter)) = self.response_waiters.remove(&id) {
                let _ = waiter.send(Err(RequestError::Disconnected));
            }
        }
    }
}
