//! Session lifecycle state machine.
//!
//! This type performs no I/O. The driver feeds it transport notifications and
//! a periodic liveness tick, and executes the [`SessionAction`]s it returns.
//! Every transport attempt carries an id; notifications from superseded
//! attempts are ignored.

use crate::identity::Identity;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("stream error {code}: {condition}")]
    Stream { code: u16, condition: String },
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("connection is not alive")]
    Inactive,
    #[error("host was suspended")]
    Suspended,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// The server rejected our resource name because another session holds it.
    pub fn is_resource_conflict(&self) -> bool {
        matches!(
            self,
            TransportError::Stream { code: 503, condition } if condition == "remote-stream-error"
        )
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        TransportError::Other(err.to_string())
    }
}

/// Timing knobs for reconnection and liveness, all in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub backoff_min: u64,
    pub backoff_max: u64,
    /// A connection that survives this long resets the backoff.
    pub stable_after: u64,
    /// Seconds without transport activity before the session is presumed dead.
    pub inactivity: u64,
    pub tick: u64,
    /// Largest wall-clock gap between ticks tolerated before assuming the
    /// host was suspended.
    pub poll_wait: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff_min: 2,
            backoff_max: 16,
            stable_after: 360,
            inactivity: 45,
            tick: 1,
            poll_wait: 30,
        }
    }
}

impl ReconnectPolicy {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick.max(1))
    }

    fn random_backoff(&self) -> u64 {
        let max = self.backoff_max.max(self.backoff_min);
        rand::rng().random_range(self.backoff_min..=max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub elapsed: u64,
    pub threshold: u64,
}

/// Everything a transport needs to open one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub attempt: u64,
    pub endpoint: String,
    pub uid: String,
    pub realm: String,
    pub password: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a new transport for this attempt, superseding any previous one.
    Connect(ConnectParams),
    /// Tear down the transport of the given attempt.
    Disconnect { attempt: u64 },
    EmitConnected,
    EmitDisconnected { error: Option<TransportError> },
}

#[derive(Debug)]
pub struct SessionMachine {
    policy: ReconnectPolicy,
    identity: Identity,
    endpoint: String,
    status: SessionStatus,
    armed: bool,
    attempt: u64,
    errors: Vec<TransportError>,
    backoff: Option<Backoff>,
    stable_at: Option<(u64, i64)>,
    announced: bool,
    last_activity: Option<u64>,
    idle_secs: u64,
    last_tick: Option<i64>,
}

impl SessionMachine {
    pub fn new(identity: Identity, endpoint: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            identity,
            endpoint: endpoint.into(),
            status: SessionStatus::Idle,
            armed: false,
            attempt: 0,
            errors: Vec::new(),
            backoff: None,
            stable_at: None,
            announced: false,
            last_activity: None,
            idle_secs: 0,
            last_tick: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Inbound stanzas are only processed while `attempt` is the live session.
    pub fn accepts(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.status == SessionStatus::Connected
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn backoff(&self) -> Option<Backoff> {
        self.backoff
    }

    pub fn pending_errors(&self) -> &[TransportError] {
        &self.errors
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Arms auto-reconnect and opens a transport. An empty endpoint keeps the
    /// previous one.
    pub fn connect(&mut self, endpoint: Option<&str>) -> Vec<SessionAction> {
        if let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) {
            self.endpoint = endpoint.to_string();
        }
        self.armed = true;
        vec![self.open()]
    }

    /// Like [`connect`](Self::connect), dropping a live session first.
    pub fn reconnect(&mut self, endpoint: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.is_connected() {
            actions.extend(self.disconnect());
        }
        actions.extend(self.connect(Some(endpoint)));
        actions
    }

    /// Terminal for the current session: disarms reconnection. Idempotent.
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        self.armed = false;
        match self.status {
            SessionStatus::Idle | SessionStatus::Disconnected => Vec::new(),
            SessionStatus::Connecting => {
                self.status = SessionStatus::Disconnected;
                vec![SessionAction::Disconnect {
                    attempt: self.attempt,
                }]
            }
            SessionStatus::Connected => {
                info!(target: "Client/Session", "Disconnecting on request");
                self.teardown(None)
            }
        }
    }

    pub fn handle_connected(&mut self, attempt: u64, now: i64) -> Vec<SessionAction> {
        if self.is_stale(attempt, "connected") || self.status != SessionStatus::Connecting {
            return Vec::new();
        }
        info!(target: "Client/Session", "Connected as {}", self.identity.full_jid());
        self.status = SessionStatus::Connected;
        self.announced = true;
        self.last_activity = None;
        self.idle_secs = 0;
        self.stable_at = Some((attempt, now + self.policy.stable_after as i64));
        vec![SessionAction::EmitConnected]
    }

    pub fn handle_error(&mut self, attempt: u64, error: TransportError) -> Vec<SessionAction> {
        if self.is_stale(attempt, "error") {
            return Vec::new();
        }
        warn!(target: "Client/Session", "Transport error on attempt {attempt}: {error}");

        if error.is_resource_conflict() {
            self.identity.regenerate_resource();
            info!(
                target: "Client/Session",
                "Resource conflict, switching to {}", self.identity.resource
            );
        }

        self.errors.push(error);
        if self.status == SessionStatus::Connected {
            let first = self.errors.first().cloned();
            return self.teardown(first);
        }
        self.status = SessionStatus::Disconnected;
        Vec::new()
    }

    /// The transport closed on its own.
    pub fn handle_disconnected(&mut self, attempt: u64) -> Vec<SessionAction> {
        if self.is_stale(attempt, "disconnected") {
            return Vec::new();
        }
        self.status = SessionStatus::Disconnected;
        self.announce_disconnected(self.errors.first().cloned())
    }

    /// Periodic liveness check.
    ///
    /// `activity` is the transport's monotonically advancing request counter,
    /// if it exposes one. `now` is wall-clock seconds.
    pub fn tick(&mut self, now: i64, activity: Option<u64>) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if let Some((attempt, deadline)) = self.stable_at {
            if now >= deadline {
                self.stable_at = None;
                if attempt == self.attempt && self.is_connected() {
                    debug!(target: "Client/Session", "Connection stable, clearing backoff");
                    self.backoff = None;
                }
            }
        }

        if self.armed {
            if !self.errors.is_empty() {
                self.errors.clear();
                let threshold = self.policy.random_backoff();
                debug!(target: "Client/Session", "Reconnecting in {threshold}s");
                self.backoff = Some(Backoff {
                    elapsed: self.policy.tick,
                    threshold,
                });
            } else if matches!(
                self.status,
                SessionStatus::Idle | SessionStatus::Disconnected
            ) {
                match self.backoff.as_mut() {
                    Some(backoff) if backoff.elapsed < backoff.threshold => {
                        backoff.elapsed += self.policy.tick;
                    }
                    _ => actions.push(self.open()),
                }
            } else if self.is_connected() {
                actions.extend(self.check_liveness(now, activity));
            }
        }

        self.last_tick = Some(now);
        actions
    }

    fn check_liveness(&mut self, now: i64, activity: Option<u64>) -> Vec<SessionAction> {
        if let Some(counter) = activity {
            self.idle_secs += self.policy.tick;
            if self.last_activity != Some(counter) {
                self.last_activity = Some(counter);
                self.idle_secs = 0;
            } else if self.idle_secs > self.policy.inactivity {
                warn!(target: "Client/Session", "No transport activity for {}s", self.idle_secs);
                self.errors.push(TransportError::Inactive);
                return self.teardown(Some(TransportError::Inactive));
            }
        }

        if let Some(last) = self.last_tick {
            let gap = now.abs_diff(last);
            if gap > self.policy.poll_wait {
                warn!(target: "Client/Session", "Clock jumped {gap}s between ticks");
                self.errors.push(TransportError::Suspended);
                return self.teardown(Some(TransportError::Suspended));
            }
        }

        Vec::new()
    }

    fn open(&mut self) -> SessionAction {
        self.attempt += 1;
        self.status = SessionStatus::Connecting;
        debug!(target: "Client/Session", "Opening attempt {} to {}", self.attempt, self.endpoint);
        SessionAction::Connect(ConnectParams {
            attempt: self.attempt,
            endpoint: self.endpoint.clone(),
            uid: self.identity.uid.clone(),
            realm: self.identity.realm.clone(),
            password: self.identity.password().to_string(),
            resource: self.identity.resource.clone(),
        })
    }

    fn teardown(&mut self, error: Option<TransportError>) -> Vec<SessionAction> {
        self.status = SessionStatus::Disconnected;
        let mut actions = vec![SessionAction::Disconnect {
            attempt: self.attempt,
        }];
        actions.extend(self.announce_disconnected(error));
        actions
    }

    fn announce_disconnected(&mut self, error: Option<TransportError>) -> Vec<SessionAction> {
        if !self.announced {
            return Vec::new();
        }
        self.announced = false;
        let reason = error
            .as_ref()
            .map(|e| format!(": {e}"))
            .unwrap_or_default();
        info!(target: "Client/Session", "Disconnected{reason}");
        vec![SessionAction::EmitDisconnected { error }]
    }

    fn is_stale(&self, attempt: u64, what: &str) -> bool {
        if attempt != self.attempt {
            warn!(
                target: "Client/Session",
                "Ignoring {what} from stale attempt {attempt} (current {})", self.attempt
            );
            return true;
        }
        false
    }
}
