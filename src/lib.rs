// Re-export core modules so applications need a single dependency
pub use sbcore::{collection, identity, presence, pubsub, resource, session, stanza};

pub mod types {
    pub use sbcore::types::*;
}

pub mod bundle;
pub mod client;
pub mod config;
pub mod events;
pub mod features;
pub mod handlers;
pub mod request;
pub mod transport;

pub use bundle::{Switchboard, SwitchboardBuilder};
pub use client::{Client, ClientError};
pub use config::ClientConfig;
pub use request::{InfoQuery, RequestError};
pub use sbcore::types::events::Event;
