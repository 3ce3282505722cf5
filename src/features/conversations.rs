//! One-to-one chat with colleagues and delivery receipts.

use crate::client::{Client, ClientError};
use crate::handlers::StanzaHandler;
use async_trait::async_trait;
use chrono::Utc;
use sbcore::stanza::{Stanza, StanzaKind};
use sbcore::types::events::Event;
use sbcore::types::message::{
    ChatMessage, MessageDirection, NS_RECEIPTS, chat_body, chat_stanza, delay_stamp,
    receipt_stanza, split_jid,
};
use std::sync::Arc;

pub(crate) const PRIORITY: i32 = 50;

/// Turns a chat message into its event. Returns `None` for anything that is
/// neither a receipt nor a chat body.
pub fn parse_chat(stanza: &Stanza) -> Option<Event> {
    let from = stanza.attr("from")?;
    let (bare, _) = split_jid(from);

    if let Some(receipt) = stanza.get_child_ns("received", NS_RECEIPTS) {
        return Some(Event::MessageDelivered {
            from: bare.to_string(),
            id: receipt.id()?.to_string(),
        });
    }

    let body = chat_body(stanza)?;
    Some(Event::MessageReceived(ChatMessage {
        id: stanza.id().map(str::to_string),
        from: Some(bare.to_string()),
        to: stanza.attr("to").map(|to| split_jid(to).0.to_string()),
        direction: MessageDirection::Incoming,
        body: body.to_string(),
        time: delay_stamp(stanza),
        delivered: false,
    }))
}

struct ConversationsHandler;

#[async_trait]
impl StanzaHandler for ConversationsHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        match parse_chat(stanza) {
            Some(event) => {
                client.dispatch_event(event);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct Conversations {
    client: Arc<Client>,
}

impl Conversations {
    pub fn new(client: Arc<Client>) -> Self {
        client.register_handler(StanzaKind::Message, PRIORITY, Arc::new(ConversationsHandler));
        Self { client }
    }

    /// Sends `body` to the colleague at `to` and announces it as sent.
    pub async fn send(&self, to: &str, body: &str) -> Result<ChatMessage, ClientError> {
        let id = self.client.generate_request_id();
        self.client.send(&chat_stanza(to, &id, body)).await?;

        let message = ChatMessage {
            id: Some(id),
            from: Some(self.client.jid()),
            to: Some(to.to_string()),
            direction: MessageDirection::Outgoing,
            body: body.to_string(),
            time: Utc::now(),
            delivered: false,
        };
        self.client.dispatch_event(Event::MessageSent(message.clone()));
        Ok(message)
    }

    /// Tells the sender that message `id` was read.
    pub async fn send_delivery_confirmation(&self, to: &str, id: &str) -> Result<(), ClientError> {
        self.client.send(&receipt_stanza(to, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbcore::stanza::StanzaBuilder;

    #[test]
    fn test_chat_body_becomes_received_message() {
        let stanza = StanzaBuilder::new("message")
            .attr("from", "202@pbx.local/desk")
            .attr("to", "201@pbx.local/web")
            .attr("type", "chat")
            .attr("id", "m7")
            .child(StanzaBuilder::new("body").text("lunch?").build())
            .build();

        match parse_chat(&stanza) {
            Some(Event::MessageReceived(message)) => {
                assert_eq!(message.id.as_deref(), Some("m7"));
                assert_eq!(message.from.as_deref(), Some("202@pbx.local"));
                assert_eq!(message.to.as_deref(), Some("201@pbx.local"));
                assert!(message.is_incoming());
                assert_eq!(message.body, "lunch?");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_receipt_becomes_delivery() {
        let stanza = StanzaBuilder::new("message")
            .attr("from", "202@pbx.local/desk")
            .child(
                StanzaBuilder::new("received")
                    .attr("xmlns", NS_RECEIPTS)
                    .attr("id", "m7")
                    .build(),
            )
            .build();

        match parse_chat(&stanza) {
            Some(Event::MessageDelivered { from, id }) => {
                assert_eq!(from, "202@pbx.local");
                assert_eq!(id, "m7");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_other_messages_pass_through() {
        let headline = StanzaBuilder::new("message")
            .attr("from", "202@pbx.local")
            .attr("type", "headline")
            .child(StanzaBuilder::new("body").text("news").build())
            .build();
        assert!(parse_chat(&headline).is_none());

        let no_sender = chat_stanza("201@pbx.local", "m1", "hi");
        assert!(parse_chat(&no_sender).is_none());
    }
}
