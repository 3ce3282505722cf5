use crate::collection::{Entity, RawItem};
use crate::resource::{PassiveFactory, RawResource, ResourceFactory, ResourceInfo, ResourceSet};
use crate::stanza::Stanza;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

/// One leg of a call, typically one registered device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Channel {
    pub id: String,
    pub sip_id: Option<String>,
    pub reg_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Callee {
    pub number: String,
    pub name: String,
    pub jid: Option<String>,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCall {
    pub id: Option<String>,
    pub channels: Vec<Channel>,
    pub state: Option<String>,
    pub direction: Option<String>,
    pub callee: Callee,
    pub info: Option<String>,
    pub duration: Option<i64>,
    pub flags: Vec<String>,
    pub meet: Option<String>,
    pub cause: Option<String>,
    pub resources: Vec<RawResource>,
}

impl RawItem for RawCall {
    const KIND: &'static str = "call";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl RawCall {
    pub fn from_stanza(node: &Stanza) -> Self {
        let attr = |key: &str| node.attr(key).map(str::to_string);

        let channels = node
            .descendants("channel")
            .into_iter()
            .map(|c| Channel {
                id: c.attr("id").unwrap_or_default().to_string(),
                sip_id: c.attr("sip_id").map(str::to_string),
                reg_id: c.attr("reg_id").map(str::to_string),
            })
            .collect();

        let data = node.attr("callee_data").and_then(|raw| {
            serde_json::from_str(raw)
                .inspect_err(|e| warn!(target: "Calls", "Ignoring malformed callee_data: {e}"))
                .ok()
        });

        Self {
            id: attr("id"),
            channels,
            state: attr("state"),
            direction: attr("direction"),
            callee: Callee {
                number: node.attr("callee_number").unwrap_or_default().to_string(),
                name: node.attr("callee_name").unwrap_or_default().to_string(),
                jid: attr("callee_jid").filter(|j| !j.is_empty()),
                id: attr("callee_id"),
                kind: attr("callee_type"),
                data,
            },
            info: attr("info").filter(|i| !i.is_empty()),
            duration: node.attr("duration").and_then(|d| d.trim().parse().ok()),
            flags: node
                .attr("flags")
                .map(|f| f.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            meet: attr("meet").filter(|m| !m.is_empty()),
            cause: attr("cause"),
            resources: node
                .descendants("resource")
                .into_iter()
                .map(RawResource::from_stanza)
                .collect(),
        }
    }

    /// Every `<call/>` below `parent`, in document order.
    pub fn parse_all(parent: &Stanza) -> Vec<Self> {
        parent
            .descendants("call")
            .into_iter()
            .map(Self::from_stanza)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimpleStatus {
    Active,
    Ringing,
    Down,
}

/// Everything about a call except its live resources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallDetails {
    pub id: String,
    pub channels: Vec<Channel>,
    pub state: String,
    pub direction: String,
    pub callee: Callee,
    pub info: Option<String>,
    pub duration: i64,
    /// When `duration` was received; the live duration grows from here.
    pub duration_base: DateTime<Utc>,
    pub flags: Vec<String>,
    pub meet: Option<String>,
    pub cause: Option<String>,
}

impl CallDetails {
    fn from_raw(raw: &RawCall) -> Self {
        Self {
            id: raw.id.clone().unwrap_or_default(),
            channels: raw.channels.clone(),
            state: raw.state.clone().unwrap_or_default(),
            direction: raw.direction.clone().unwrap_or_default(),
            callee: raw.callee.clone(),
            info: raw.info.clone(),
            duration: raw.duration.unwrap_or_default(),
            duration_base: Utc::now(),
            flags: raw.flags.clone(),
            meet: raw.meet.clone(),
            cause: raw.cause.clone(),
        }
    }

    fn apply(&mut self, raw: &RawCall) {
        self.channels = raw.channels.clone();
        self.callee = raw.callee.clone();
        self.info = raw.info.clone();
        self.duration = raw.duration.unwrap_or_default();
        self.duration_base = Utc::now();
        if let Some(state) = &raw.state {
            self.state = state.clone();
        }
        self.flags = raw.flags.clone();
        self.meet = raw.meet.clone();
        if raw.cause.is_some() {
            self.cause = raw.cause.clone();
        }
    }

    pub fn duration_at(&self, now: DateTime<Utc>) -> i64 {
        self.duration + (now.timestamp() - self.duration_base.timestamp())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == "incoming"
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == "outgoing"
    }

    pub fn is_muted(&self) -> bool {
        self.has_flag("muted")
    }

    pub fn is_transferable(&self) -> bool {
        self.has_flag("transferable")
    }

    pub fn is_recorded(&self) -> bool {
        self.has_flag("recorded")
    }

    pub fn is_active(&self) -> bool {
        self.state == "active"
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self.state.as_str(), "ringing" | "early")
    }

    pub fn is_on_hold(&self) -> bool {
        matches!(
            self.state.as_str(),
            "pausing" | "paused" | "onhold" | "held"
        )
    }

    pub fn is_terminated(&self) -> bool {
        self.state == "down"
    }

    pub fn simple_status(&self) -> SimpleStatus {
        if self.is_ringing() {
            SimpleStatus::Ringing
        } else if self.is_terminated() {
            SimpleStatus::Down
        } else {
            SimpleStatus::Active
        }
    }
}

/// Immutable view of a call taken at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub details: CallDetails,
    pub resources: Vec<ResourceInfo>,
}

impl std::ops::Deref for CallSnapshot {
    type Target = CallDetails;

    fn deref(&self) -> &CallDetails {
        &self.details
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallUpdate {
    pub previous: CallSnapshot,
    /// Resources destroyed because the meet key changed.
    pub invalidated: Vec<ResourceInfo>,
}

#[derive(Debug)]
pub struct Call {
    pub details: CallDetails,
    pub resources: ResourceSet,
}

impl Call {
    /// Builds a call, creating handlers for the resources it arrives with.
    pub fn from_raw_with(raw: RawCall, factory: &dyn ResourceFactory) -> Self {
        let details = CallDetails::from_raw(&raw);
        let mut resources = ResourceSet::new();
        let call_id = details.id.clone();
        resources.add_resources(raw.resources, |r| factory.create_handler(&call_id, r));
        Self { details, resources }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            details: self.details.clone(),
            resources: self.resources.infos(),
        }
    }

    /// Applies an update. A change of meet key destroys every resource, since
    /// they belong to the previous meeting.
    pub fn update(&mut self, raw: &RawCall) -> CallUpdate {
        let previous = self.snapshot();
        self.details.apply(raw);
        let invalidated = if previous.details.meet != self.details.meet {
            self.resources.destroy_all()
        } else {
            Vec::new()
        };
        CallUpdate {
            previous,
            invalidated,
        }
    }

    /// Destroys every resource and marks the call down.
    pub fn terminate(&mut self, cause: Option<String>) -> Vec<ResourceInfo> {
        let removed = self.resources.destroy_all();
        self.details.state = "down".to_string();
        if cause.is_some() {
            self.details.cause = cause;
        }
        removed
    }
}

impl Entity for Call {
    type Raw = RawCall;

    fn id(&self) -> &str {
        &self.details.id
    }

    fn from_raw(raw: RawCall) -> Self {
        Self::from_raw_with(raw, &PassiveFactory)
    }

    fn update_from_raw(&mut self, raw: RawCall) {
        self.update(&raw);
    }
}
