use crate::presence::{PresenceSnapshot, Registration, ResourceAvailability};
use crate::pubsub::PubSubItem;
use crate::resource::ResourceInfo;
use crate::session::TransportError;
use crate::types::call::CallSnapshot;
use crate::types::colleague::Colleague;
use crate::types::conference::{Conference, ConferenceParticipant};
use crate::types::message::ChatMessage;
use crate::types::queue::{Queue, QueueCall};
use log::error;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Hands the event to every handler in registration order. A panicking
    /// handler is logged and the rest still run.
    pub fn dispatch(&self, event: &Event) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))).is_err() {
                error!(target: "Events", "Event handler panicked on {}", event.name());
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Connected;

#[derive(Debug, Clone, Serialize)]
pub struct Disconnected {
    pub error: Option<String>,
}

impl Disconnected {
    pub fn from_error(error: Option<&TransportError>) -> Self {
        Self {
            error: error.map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallResourceEvent {
    pub call: CallSnapshot,
    pub resource: ResourceInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCallEvent {
    pub queue: String,
    pub call: QueueCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceResource {
    pub jid: String,
    pub resource: String,
    pub availability: ResourceAvailability,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeItemEvent {
    pub node: String,
    pub item: PubSubItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantPresence {
    pub conference: String,
    pub participant: ConferenceParticipant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConferenceMessage {
    pub conference: String,
    /// Sender's participant id; `None` for our own messages echoed back.
    pub participant: Option<String>,
    pub message: ChatMessage,
}

/// A generic server-pushed pub event with a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubEvent {
    pub kind: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Connected(Connected),
    Disconnected(Disconnected),

    RegistrationsChanged(Vec<Registration>),
    CallAdded(CallSnapshot),
    CallUpdated {
        call: CallSnapshot,
        previous: CallSnapshot,
    },
    CallTerminated {
        call: CallSnapshot,
        cause: Option<String>,
    },
    CallResourceAdded(CallResourceEvent),
    CallResourceUpdated(CallResourceEvent),
    CallResourceRemoved(CallResourceEvent),

    QueueAdded(Queue),
    QueueUpdated(Queue),
    QueueDeleted(Queue),
    QueueCallAdded(QueueCallEvent),
    QueueCallUpdated(QueueCallEvent),
    QueueCallDeleted(QueueCallEvent),

    ColleagueAdded(Colleague),
    ColleagueUpdated(Colleague),
    ColleagueDeleted(Colleague),
    PresenceChanged {
        jid: String,
        presence: PresenceSnapshot,
    },
    PresenceResource(PresenceResource),

    ConferenceAvailable(Conference),
    ConferenceChanged(Conference),
    ConferenceInvite(Conference),
    ConferenceClosed {
        conference: Conference,
        reason: String,
    },
    ParticipantPresence(ParticipantPresence),
    ConferenceMessage(ConferenceMessage),

    MessageReceived(ChatMessage),
    MessageSent(ChatMessage),
    MessageDelivered {
        from: String,
        id: String,
    },

    NodeStored(NodeItemEvent),
    NodeCleared(NodeItemEvent),
    NodeBroadcast(NodeItemEvent),
    Pub(PubEvent),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected(_) => "connected",
            Event::Disconnected(_) => "disconnected",
            Event::RegistrationsChanged(_) => "registrations_changed",
            Event::CallAdded(_) => "call_added",
            Event::CallUpdated { .. } => "call_updated",
            Event::CallTerminated { .. } => "call_terminated",
            Event::CallResourceAdded(_) => "call_resource_added",
            Event::CallResourceUpdated(_) => "call_resource_updated",
            Event::CallResourceRemoved(_) => "call_resource_removed",
            Event::QueueAdded(_) => "queue_added",
            Event::QueueUpdated(_) => "queue_updated",
            Event::QueueDeleted(_) => "queue_deleted",
            Event::QueueCallAdded(_) => "queue_call_added",
            Event::QueueCallUpdated(_) => "queue_call_updated",
            Event::QueueCallDeleted(_) => "queue_call_deleted",
            Event::ColleagueAdded(_) => "colleague_added",
            Event::ColleagueUpdated(_) => "colleague_updated",
            Event::ColleagueDeleted(_) => "colleague_deleted",
            Event::PresenceChanged { .. } => "presence_changed",
            Event::PresenceResource(_) => "presence_resource",
            Event::ConferenceAvailable(_) => "conference_available",
            Event::ConferenceChanged(_) => "conference_changed",
            Event::ConferenceInvite(_) => "conference_invite",
            Event::ConferenceClosed { .. } => "conference_closed",
            Event::ParticipantPresence(_) => "participant_presence",
            Event::ConferenceMessage(_) => "conference_message",
            Event::MessageReceived(_) => "message_received",
            Event::MessageSent(_) => "message_sent",
            Event::MessageDelivered { .. } => "message_delivered",
            Event::NodeStored(_) => "node_stored",
            Event::NodeCleared(_) => "node_cleared",
            Event::NodeBroadcast(_) => "node_broadcast",
            Event::Pub(_) => "pub_event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Faulty;

    impl EventHandler for Faulty {
        fn handle_event(&self, _event: &Event) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_dispatch_survives_panicking_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = CoreEventBus::new();
        assert!(!bus.has_handlers());

        bus.add_handler(Arc::new(Faulty));
        let sink = seen.clone();
        bus.add_handler(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.name());
        }));

        bus.dispatch(&Event::Connected(Connected));
        bus.dispatch(&Event::Disconnected(Disconnected { error: None }));

        assert_eq!(*seen.lock().unwrap(), vec!["connected", "disconnected"]);
    }
}
