pub mod call;
pub mod colleague;
pub mod conference;
pub mod events;
pub mod message;
pub mod queue;

pub use call::{Call, CallDetails, CallSnapshot, RawCall};
pub use colleague::{Colleague, RawColleague};
pub use conference::{Conference, ConferenceParticipant, ConferencePresence, RawConference};
pub use message::{ChatMessage, MessageDirection};
pub use queue::{Queue, QueueCall, RawQueue, RawQueueCall};
