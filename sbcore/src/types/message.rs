use crate::stanza::{Stanza, StanzaBuilder};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const NS_RECEIPTS: &str = "urn:xmpp:receipts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// A one-to-one or conference chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub direction: MessageDirection,
    pub body: String,
    pub time: DateTime<Utc>,
    pub delivered: bool,
}

impl ChatMessage {
    pub fn is_incoming(&self) -> bool {
        self.direction == MessageDirection::Incoming
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == MessageDirection::Outgoing
    }
}

/// Non-empty `<body/>` of a `chat`, `normal` or untyped message.
pub fn chat_body(message: &Stanza) -> Option<&str> {
    if !matches!(message.stanza_type(), None | Some("") | Some("chat") | Some("normal")) {
        return None;
    }
    message
        .get_optional_child("body")
        .and_then(Stanza::text)
        .filter(|body| !body.is_empty())
}

/// Send time from `<delay stamp/>`, or now when absent or unparsable.
pub fn delay_stamp(message: &Stanza) -> DateTime<Utc> {
    message
        .descendants("delay")
        .first()
        .and_then(|delay| delay.attr("stamp"))
        .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

pub fn chat_stanza(to: &str, id: &str, body: &str) -> Stanza {
    StanzaBuilder::new("message")
        .attr("to", to)
        .attr("type", "chat")
        .attr("id", id)
        .child(StanzaBuilder::new("body").text(body).build())
        .build()
}

pub fn receipt_stanza(to: &str, id: &str) -> Stanza {
    StanzaBuilder::new("message")
        .attr("to", to)
        .attr("type", "chat")
        .child(
            StanzaBuilder::new("received")
                .attr("xmlns", NS_RECEIPTS)
                .attr("id", id)
                .build(),
        )
        .build()
}

/// Splits `user@realm/resource` into the bare address and the resource.
pub fn split_jid(jid: &str) -> (&str, Option<&str>) {
    match jid.split_once('/') {
        Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
        Some((bare, _)) => (bare, None),
        None => (jid, None),
    }
}
