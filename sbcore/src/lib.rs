pub mod collection;
pub mod identity;
pub mod presence;
pub mod pubsub;
pub mod resource;
pub mod session;
pub mod stanza;
pub mod types;
