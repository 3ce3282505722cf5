//! Conference rooms: room definitions and participant presence pushed over
//! presence stanzas, room chat, and moderator requests.

use crate::client::{Client, ClientError};
use crate::handlers::{SessionListener, StanzaHandler};
use crate::request::InfoQuery;
use async_trait::async_trait;
use log::debug;
use sbcore::collection::EntityCollection;
use sbcore::presence::Registration;
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaBuilder, StanzaKind};
use sbcore::types::conference::{
    Conference, ConferenceParticipant, ConferencePresence, RawConference,
};
use sbcore::types::events::{ConferenceMessage, Event, ParticipantPresence};
use sbcore::types::message::{
    ChatMessage, MessageDirection, chat_body, chat_stanza, delay_stamp, split_jid,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const NS_CONFERENCE: &str = "urn:switchboard:conference";
pub const NS_CONFERENCE_USER: &str = "urn:switchboard:conference#user";
pub const NS_CONFERENCE_MODERATOR: &str = "urn:switchboard:conference#moderator";

pub(crate) const PRIORITY: i32 = 1;

#[derive(Debug, Default)]
pub struct ConferencesState {
    conferences: EntityCollection<Conference>,
}

impl ConferencesState {
    pub fn conferences(&self) -> Vec<Conference> {
        self.conferences.iter().cloned().collect()
    }

    pub fn get(&self, jid: &str) -> Option<&Conference> {
        self.conferences.get(jid)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Conference> {
        self.conferences.find(|c| c.id == id)
    }

    /// Applies a room or member presence. Returns `None` when the stanza is
    /// not conference traffic.
    pub fn on_presence(&mut self, stanza: &Stanza) -> Option<Vec<Event>> {
        if let Some(x) = stanza.get_child_ns("x", NS_CONFERENCE) {
            let (jid, _) = split_jid(stanza.attr("from")?);
            return Some(self.on_room(jid, x));
        }
        if let Some(x) = stanza.get_child_ns("x", NS_CONFERENCE_USER) {
            return Some(self.on_member(stanza, x));
        }
        stanza
            .get_child_ns("x", NS_CONFERENCE_MODERATOR)
            .map(|_| Vec::new())
    }

    fn on_room(&mut self, jid: &str, x: &Stanza) -> Vec<Event> {
        if !x.descendants("invite").is_empty() {
            return self
                .get(jid)
                .map(|c| vec![Event::ConferenceInvite(c.clone())])
                .unwrap_or_default();
        }

        let known = self.conferences.contains(jid);
        self.apply_definition(jid, x);
        match self.get(jid) {
            Some(c) if known => vec![Event::ConferenceChanged(c.clone())],
            Some(c) => vec![Event::ConferenceAvailable(c.clone())],
            None => Vec::new(),
        }
    }

    fn on_member(&mut self, stanza: &Stanza, x: &Stanza) -> Vec<Event> {
        let Some(from) = stanza.attr("from") else {
            return Vec::new();
        };
        let (jid, resource) = split_jid(from);
        let Some(conference) = self.conferences.get_mut(jid) else {
            return Vec::new();
        };

        match resource {
            // Our own membership.
            None => {
                let status = stanza
                    .get_optional_child("status")
                    .and_then(Stanza::text)
                    .unwrap_or_default();
                if matches!(status, "kicked" | "exit" | "end") {
                    self.close(jid, status)
                } else {
                    Vec::new()
                }
            }
            Some(id) => {
                let Some(participant) = conference.participant_mut(id) else {
                    debug!(
                        target: "Conferences",
                        "Presence for unknown participant '{id}' in {jid}"
                    );
                    return Vec::new();
                };
                participant.presence = ConferencePresence::from_stanza(x);
                vec![Event::ParticipantPresence(ParticipantPresence {
                    conference: jid.to_string(),
                    participant: participant.clone(),
                })]
            }
        }
    }

    /// Chat from a known room. Returns `None` for anything else.
    pub fn on_message(&self, stanza: &Stanza) -> Option<Vec<Event>> {
        let (jid, resource) = split_jid(stanza.attr("from")?);
        let conference = self.get(jid)?;
        let body = chat_body(stanza)?;

        let participant = resource
            .and_then(|id| conference.participant(id))
            .map(|p| p.id.clone());
        let direction = match participant {
            Some(_) => MessageDirection::Incoming,
            None => MessageDirection::Outgoing,
        };
        let message = ChatMessage {
            id: stanza.id().map(str::to_string),
            from: None,
            to: None,
            direction,
            body: body.to_string(),
            time: delay_stamp(stanza),
            delivered: true,
        };
        Some(vec![Event::ConferenceMessage(ConferenceMessage {
            conference: jid.to_string(),
            participant,
            message,
        })])
    }

    /// Creates or replaces the room at `jid` from a room definition.
    pub fn apply_definition(&mut self, jid: &str, definition: &Stanza) -> Option<Conference> {
        let raw = RawConference::from_stanza(jid, definition);
        if self.conferences.contains(jid) {
            self.conferences.apply_update(vec![raw]);
        } else {
            self.conferences.apply_create(vec![raw]);
        }
        self.get(jid).cloned()
    }

    pub fn remove(&mut self, jid: &str) -> Option<Conference> {
        self.conferences.remove(jid)
    }

    /// Drops the room, reporting every participant offline first.
    fn close(&mut self, jid: &str, reason: &str) -> Vec<Event> {
        let Some(conference) = self.conferences.remove(jid) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        closed_events(conference, reason, &mut events);
        events
    }

    pub fn teardown(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        for conference in self.conferences.drain() {
            closed_events(conference, "disconnected", &mut events);
        }
        events
    }
}

fn closed_events(mut conference: Conference, reason: &str, events: &mut Vec<Event>) {
    for participant in conference.reset_presence() {
        events.push(Event::ParticipantPresence(ParticipantPresence {
            conference: conference.jid.clone(),
            participant,
        }));
    }
    events.push(Event::ConferenceClosed {
        conference,
        reason: reason.to_string(),
    });
}

fn lock(state: &Mutex<ConferencesState>) -> MutexGuard<'_, ConferencesState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `<subject/><members>...</members>` as a definition query.
fn definition_query(subject: &str, participants: &[ConferenceParticipant]) -> InfoQuery {
    InfoQuery::set(NS_CONFERENCE)
        .child(StanzaBuilder::new("subject").text(subject).build())
        .child(
            StanzaBuilder::new("members")
                .children(participants.iter().map(ConferenceParticipant::to_member_stanza))
                .build(),
        )
}

fn participant_list(action: &str, participants: &[&str]) -> Stanza {
    StanzaBuilder::new(action)
        .children(
            participants
                .iter()
                .map(|id| StanzaBuilder::new("item").attr("id", *id).build()),
        )
        .build()
}

struct ConferencesHandler {
    state: Arc<Mutex<ConferencesState>>,
}

#[async_trait]
impl StanzaHandler for ConferencesHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        let events = match stanza.kind() {
            Some(StanzaKind::Presence) => lock(&self.state).on_presence(stanza),
            Some(StanzaKind::Message) => lock(&self.state).on_message(stanza),
            _ => None,
        };
        match events {
            Some(events) => {
                events.into_iter().for_each(|e| client.dispatch_event(e));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionListener for ConferencesHandler {
    async fn on_disconnected(&self, client: &Arc<Client>, _error: Option<&TransportError>) {
        let events = lock(&self.state).teardown();
        events.into_iter().for_each(|e| client.dispatch_event(e));
    }
}

#[derive(Clone)]
pub struct Conferences {
    client: Arc<Client>,
    state: Arc<Mutex<ConferencesState>>,
}

impl Conferences {
    pub fn new(client: Arc<Client>) -> Self {
        let state = Arc::new(Mutex::new(ConferencesState::default()));
        let handler = Arc::new(ConferencesHandler {
            state: state.clone(),
        });
        client.register_handler(StanzaKind::Presence, PRIORITY, handler.clone());
        client.register_handler(StanzaKind::Message, PRIORITY, handler.clone());
        client.add_session_listener(handler);
        Self { client, state }
    }

    pub fn conferences(&self) -> Vec<Conference> {
        lock(&self.state).conferences()
    }

    pub fn conference(&self, jid: &str) -> Option<Conference> {
        lock(&self.state).get(jid).cloned()
    }

    pub fn conference_by_id(&self, id: &str) -> Option<Conference> {
        lock(&self.state).find_by_id(id).cloned()
    }

    fn require(&self, jid: &str) -> Result<Conference, ClientError> {
        self.conference(jid)
            .ok_or_else(|| ClientError::UnknownConference(jid.to_string()))
    }

    /// Asks the conference service for a new room and tracks it.
    pub async fn create(
        &self,
        subject: &str,
        participants: &[ConferenceParticipant],
    ) -> Result<Conference, ClientError> {
        let service = format!("conference.{}", self.client.config().realm);
        let reply = self
            .client
            .send_iq(definition_query(subject, participants).to(service))
            .await?;

        let query = reply
            .query()
            .ok_or_else(|| ClientError::UnexpectedReply("room definition without query".into()))?;
        let jid = query
            .get_optional_child("jid")
            .and_then(Stanza::text)
            .filter(|jid| !jid.is_empty())
            .ok_or_else(|| ClientError::UnexpectedReply("room definition without jid".into()))?;
        lock(&self.state)
            .apply_definition(jid, query)
            .ok_or_else(|| ClientError::UnknownConference(jid.to_string()))
    }

    /// Sends a new definition for an existing room and applies the one the
    /// server answers with.
    async fn redefine(
        &self,
        jid: &str,
        subject: &str,
        participants: &[ConferenceParticipant],
    ) -> Result<Conference, ClientError> {
        let reply = self
            .client
            .send_iq(definition_query(subject, participants).to(jid))
            .await?;
        let mut state = lock(&self.state);
        if let Some(query) = reply.query() {
            state.apply_definition(jid, query);
        }
        state
            .get(jid)
            .cloned()
            .ok_or_else(|| ClientError::UnknownConference(jid.to_string()))
    }

    fn others(&self, conference: &Conference) -> Vec<ConferenceParticipant> {
        let own = self.client.jid();
        conference
            .participants
            .iter()
            .filter(|p| p.jid() != Some(own.as_str()))
            .cloned()
            .collect()
    }

    pub async fn kick(&self, jid: &str, participant: &str) -> Result<Conference, ClientError> {
        let conference = self.require(jid)?;
        let remaining: Vec<_> = self
            .others(&conference)
            .into_iter()
            .filter(|p| p.id != participant)
            .collect();
        self.redefine(jid, &conference.subject, &remaining).await
    }

    pub async fn invite(
        &self,
        jid: &str,
        participant: ConferenceParticipant,
    ) -> Result<Conference, ClientError> {
        let conference = self.require(jid)?;
        let mut participants = self.others(&conference);
        participants.push(participant);
        self.redefine(jid, &conference.subject, &participants).await
    }

    pub async fn rename(&self, jid: &str, subject: &str) -> Result<Conference, ClientError> {
        let conference = self.require(jid)?;
        self.redefine(jid, subject, &conference.participants).await
    }

    async fn moderate(&self, jid: &str, action: Stanza) -> Result<Stanza, ClientError> {
        self.require(jid)?;
        let query = InfoQuery::set(NS_CONFERENCE_MODERATOR).to(jid).child(action);
        Ok(self.client.send_iq(query).await?)
    }

    /// Dials the room from one of our registrations.
    pub async fn originate(
        &self,
        jid: &str,
        registration: &Registration,
    ) -> Result<Stanza, ClientError> {
        let action = StanzaBuilder::new("originate")
            .attr("registration", registration.id.as_str())
            .build();
        self.moderate(jid, action).await
    }

    pub async fn originate_participants(
        &self,
        jid: &str,
        participants: &[&str],
    ) -> Result<Stanza, ClientError> {
        self.moderate(jid, participant_list("originate-participants", participants))
            .await
    }

    pub async fn terminate_participants(
        &self,
        jid: &str,
        participants: &[&str],
    ) -> Result<Stanza, ClientError> {
        self.moderate(jid, participant_list("terminate-participants", participants))
            .await
    }

    pub async fn mute(&self, jid: &str, participants: &[&str]) -> Result<Stanza, ClientError> {
        self.moderate(jid, participant_list("mute", participants))
            .await
    }

    pub async fn unmute(&self, jid: &str, participants: &[&str]) -> Result<Stanza, ClientError> {
        self.moderate(jid, participant_list("unmute", participants))
            .await
    }

    /// Ends the room for everyone.
    pub async fn close(&self, jid: &str) -> Result<Stanza, ClientError> {
        self.moderate(jid, StanzaBuilder::new("close").build())
            .await
    }

    /// Leaves the room and stops tracking it.
    pub async fn exit(&self, jid: &str) -> Result<(), ClientError> {
        self.require(jid)?;
        let query = InfoQuery::set(NS_CONFERENCE_USER)
            .to(jid)
            .child(StanzaBuilder::new("exit").build());
        self.client.send_iq(query).await?;
        lock(&self.state).remove(jid);
        Ok(())
    }

    /// Posts `body` to the room chat.
    pub async fn send(&self, jid: &str, body: &str) -> Result<(), ClientError> {
        self.require(jid)?;
        let id = self.client.generate_request_id();
        self.client.send(&chat_stanza(jid, &id, body)).await
    }
}
