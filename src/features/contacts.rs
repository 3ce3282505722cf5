//! Colleague directory and per-colleague presence.

use crate::client::{Client, ClientError};
use crate::handlers::{SessionListener, StanzaHandler};
use crate::request::InfoQuery;
use async_trait::async_trait;
use log::debug;
use sbcore::collection::{Entity, EntityCollection};
use sbcore::presence::{Availability, PresenceRoster, PresenceSnapshot, Registration};
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaKind};
use sbcore::types::colleague::{Colleague, RawColleague};
use sbcore::types::events::{Event, PresenceResource};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const NS_CONTACTS: &str = "urn:switchboard:contacts";

pub(crate) const PRIORITY: i32 = 1;

/// Reads an aggregated presence:
/// `<presence from="uid@realm" [type="unavailable"]><show/><status/>
/// <location/><resource id/>*<registration/>*</presence>`.
///
/// Returns the sender's bare jid and the snapshot it describes.
pub fn parse_presence(stanza: &Stanza) -> Option<(String, PresenceSnapshot)> {
    let from = stanza.attr("from")?;
    let jid = from.split('/').next().unwrap_or(from).to_string();

    if stanza.stanza_type() == Some("unavailable") {
        return Some((jid, PresenceSnapshot::offline()));
    }

    let text_of = |tag: &str| {
        stanza
            .get_optional_child(tag)
            .and_then(Stanza::text)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };
    let show = text_of("show");
    let snapshot = PresenceSnapshot {
        online: true,
        availability: Availability::from_show(show.as_deref()),
        message: text_of("status"),
        location: text_of("location"),
        resources: stanza
            .children()
            .iter()
            .filter(|c| c.tag == "resource")
            .filter_map(|c| c.attr("id"))
            .map(str::to_string)
            .collect(),
        registrations: stanza
            .children()
            .iter()
            .filter(|c| c.tag == "registration")
            .filter_map(Registration::from_stanza)
            .collect(),
    };
    Some((jid, snapshot))
}

#[derive(Debug, Default)]
pub struct ContactsState {
    colleagues: EntityCollection<Colleague>,
    presence: PresenceRoster,
}

impl ContactsState {
    pub fn colleagues(&self) -> Vec<Colleague> {
        self.colleagues.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Colleague> {
        self.colleagues.get(id)
    }

    pub fn find_by_jid(&self, jid: &str) -> Option<&Colleague> {
        self.colleagues.find(|c| c.jid == jid)
    }

    pub fn presence(&self, jid: &str) -> PresenceSnapshot {
        self.presence.get(jid).cloned().unwrap_or_default()
    }

    pub fn on_message(&mut self, message: &Stanza) -> Option<Vec<Event>> {
        let event = message.get_child_ns("event", NS_CONTACTS)?;
        let items = RawColleague::parse_all(event);
        let events = match event.attr("type") {
            Some("create") => self.add(items),
            Some("update") => self
                .colleagues
                .apply_update_with(items, |colleague, raw| {
                    colleague.update_from_raw(raw);
                    Event::ColleagueUpdated(colleague.clone())
                }),
            Some("delete") => self
                .colleagues
                .apply_delete(items)
                .into_iter()
                .map(|(colleague, _)| {
                    self.presence.remove(&colleague.jid);
                    Event::ColleagueDeleted(colleague)
                })
                .collect(),
            other => {
                debug!(target: "Contacts", "Ignoring colleague event of type {other:?}");
                Vec::new()
            }
        };
        Some(events)
    }

    fn add(&mut self, items: Vec<RawColleague>) -> Vec<Event> {
        let added = self.colleagues.apply_create(items);
        added
            .iter()
            .filter_map(|id| self.colleagues.get(id))
            .map(|c| Event::ColleagueAdded(c.clone()))
            .collect()
    }

    /// Installs the colleague list returned by a directory fetch.
    pub fn replace(&mut self, items: Vec<RawColleague>) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .colleagues
            .drain()
            .into_iter()
            .map(Event::ColleagueDeleted)
            .collect();
        events.extend(self.add(items));
        events
    }

    /// Presence from a known colleague replaces their snapshot. Returns
    /// `None` when the sender is not a colleague.
    pub fn on_presence(&mut self, stanza: &Stanza) -> Option<Vec<Event>> {
        let (jid, snapshot) = parse_presence(stanza)?;
        self.find_by_jid(&jid)?;

        let transitions = self.presence.replace(&jid, snapshot.clone());
        let mut events = Vec::with_capacity(transitions.len() + 1);
        events.push(Event::PresenceChanged {
            jid: jid.clone(),
            presence: snapshot,
        });
        events.extend(transitions.into_iter().map(|t| {
            Event::PresenceResource(PresenceResource {
                jid: jid.clone(),
                resource: t.resource,
                availability: t.availability,
            })
        }));
        Some(events)
    }

    pub fn teardown(&mut self) -> Vec<Event> {
        self.presence.clear();
        self.colleagues
            .drain()
            .into_iter()
            .map(Event::ColleagueDeleted)
            .collect()
    }
}

struct ContactsHandler {
    state: Arc<Mutex<ContactsState>>,
}

impl ContactsHandler {
    fn lock(&self) -> MutexGuard<'_, ContactsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StanzaHandler for ContactsHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        let events = match stanza.kind() {
            Some(StanzaKind::Presence) => self.lock().on_presence(stanza),
            Some(StanzaKind::Message) => self.lock().on_message(stanza),
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
impl SessionListener for ContactsHandler {
    async fn on_disconnected(&self, client: &Arc<Client>, _error: Option<&TransportError>) {
        let events = self.lock().teardown();
        events.into_iter().for_each(|e| client.dispatch_event(e));
    }
}

#[derive(Clone)]
pub struct Contacts {
    client: Arc<Client>,
    state: Arc<Mutex<ContactsState>>,
}

impl Contacts {
    pub fn new(client: Arc<Client>) -> Self {
        let state = Arc::new(Mutex::new(ContactsState::default()));
        let handler = Arc::new(ContactsHandler {
            state: state.clone(),
        });
        client.register_handler(StanzaKind::Presence, PRIORITY, handler.clone());
        client.register_handler(StanzaKind::Message, PRIORITY, handler.clone());
        client.add_session_listener(handler);
        Self { client, state }
    }

    fn lock(&self) -> MutexGuard<'_, ContactsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn colleagues(&self) -> Vec<Colleague> {
        self.lock().colleagues()
    }

    pub fn colleague(&self, id: &str) -> Option<Colleague> {
        self.lock().get(id).cloned()
    }

    pub fn colleague_by_jid(&self, jid: &str) -> Option<Colleague> {
        self.lock().find_by_jid(jid).cloned()
    }

    /// Latest presence of `jid`; offline when nothing was received yet.
    pub fn presence(&self, jid: &str) -> PresenceSnapshot {
        self.lock().presence(jid)
    }

    /// Fetches the directory and replaces the local colleague list.
    pub async fn retrieve(&self) -> Result<Vec<Colleague>, ClientError> {
        let reply = self.client.send_iq(InfoQuery::get(NS_CONTACTS)).await?;
        let items = reply
            .query()
            .map(RawColleague::parse_all)
            .unwrap_or_default();
        let events = self.lock().replace(items);
        events
            .into_iter()
            .for_each(|e| self.client.dispatch_event(e));
        Ok(self.colleagues())
    }
}
