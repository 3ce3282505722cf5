//! Conference rooms as announced by conference presence.
//!
//! A room is described by `<x/>` with `<subject/>`, `<options><item name
//! value/></options>` and `<members><item id role><jid/>|<extension/></item>
//! </members>`. Rooms are keyed by their bare address.

use crate::collection::{Entity, RawItem};
use crate::stanza::{Stanza, StanzaBuilder};
use indexmap::IndexMap;
use log::debug;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AudioStatus {
    #[default]
    Disconnected,
    Invited,
    Connected,
    Muted,
}

impl AudioStatus {
    fn from_text(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            Some("invited") => AudioStatus::Invited,
            Some("connected") => AudioStatus::Connected,
            Some("muted") => AudioStatus::Muted,
            Some("disconnected") | None => AudioStatus::Disconnected,
            Some(other) => {
                debug!(target: "Conferences", "Unknown audio status '{other}'");
                AudioStatus::Disconnected
            }
        }
    }
}

/// A participant's state inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConferencePresence {
    pub online: bool,
    pub show: Option<String>,
    pub audio: AudioStatus,
    pub audio_muted: bool,
    pub speaking: bool,
}

impl ConferencePresence {
    pub fn offline() -> Self {
        Self::default()
    }

    /// `<x><show/><online/><audio/><audio-mute/><speaking/></x>`
    pub fn from_stanza(x: &Stanza) -> Self {
        let flag = |tag: &str| x.get_optional_child(tag).is_some();
        Self {
            online: flag("online"),
            show: x
                .get_optional_child("show")
                .and_then(Stanza::text)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            audio: AudioStatus::from_text(x.get_optional_child("audio").and_then(Stanza::text)),
            audio_muted: flag("audio-mute"),
            speaking: flag("speaking"),
        }
    }

    pub fn is_away(&self) -> bool {
        self.show.as_deref() == Some("away")
    }

    pub fn is_dnd(&self) -> bool {
        self.show.as_deref() == Some("dnd")
    }

    pub fn is_audio_invited(&self) -> bool {
        self.audio == AudioStatus::Invited
    }

    pub fn is_audio_connected(&self) -> bool {
        matches!(self.audio, AudioStatus::Connected | AudioStatus::Muted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParticipantContact {
    /// A colleague, by bare address.
    Colleague(String),
    /// An external number.
    Tel(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConferenceParticipant {
    pub id: String,
    pub contact: Option<ParticipantContact>,
    pub role: String,
    pub presence: ConferencePresence,
}

impl ConferenceParticipant {
    pub fn colleague(id: impl Into<String>, jid: impl Into<String>) -> Self {
        Self::new(id, Some(ParticipantContact::Colleague(jid.into())))
    }

    pub fn tel(id: impl Into<String>, number: impl Into<String>) -> Self {
        Self::new(id, Some(ParticipantContact::Tel(number.into())))
    }

    fn new(id: impl Into<String>, contact: Option<ParticipantContact>) -> Self {
        Self {
            id: id.into(),
            contact,
            role: "participant".to_string(),
            presence: ConferencePresence::offline(),
        }
    }

    pub fn jid(&self) -> Option<&str> {
        match &self.contact {
            Some(ParticipantContact::Colleague(jid)) => Some(jid),
            _ => None,
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.role == "moderator"
    }

    fn from_stanza(item: &Stanza) -> Self {
        let text_of = |tag: &str| {
            item.get_optional_child(tag)
                .and_then(Stanza::text)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        let contact = text_of("jid")
            .map(ParticipantContact::Colleague)
            .or_else(|| text_of("extension").map(ParticipantContact::Tel));
        let id = item
            .attr("id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| (rand::random::<u32>() % 10_000_000 + 1).to_string());
        Self {
            id,
            contact,
            role: item.attr("role").unwrap_or("participant").to_string(),
            presence: ConferencePresence::offline(),
        }
    }

    /// `<item id role="participant"><jid/>|<extension/></item>` as sent in a
    /// room definition.
    pub fn to_member_stanza(&self) -> Stanza {
        let item = StanzaBuilder::new("item")
            .attr("id", self.id.as_str())
            .attr("role", "participant");
        match &self.contact {
            Some(ParticipantContact::Colleague(jid)) => item
                .child(StanzaBuilder::new("jid").text(jid.as_str()).build())
                .build(),
            Some(ParticipantContact::Tel(number)) => item
                .child(StanzaBuilder::new("extension").text(number.as_str()).build())
                .build(),
            None => item.build(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawConference {
    pub jid: Option<String>,
    pub subject: Option<String>,
    pub members: Vec<ConferenceParticipant>,
    pub options: IndexMap<String, String>,
}

impl RawItem for RawConference {
    const KIND: &'static str = "conference";

    fn id(&self) -> Option<&str> {
        self.jid.as_deref()
    }
}

impl RawConference {
    pub fn from_stanza(jid: &str, node: &Stanza) -> Self {
        let options = node
            .get_optional_child("options")
            .map(|options| {
                options
                    .descendants("item")
                    .into_iter()
                    .filter_map(|item| {
                        Some((item.attr("name")?.to_string(), item.attr("value")?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let members = node
            .get_optional_child("members")
            .map(|members| {
                members
                    .descendants("item")
                    .into_iter()
                    .map(ConferenceParticipant::from_stanza)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            jid: Some(jid.to_string()),
            subject: node
                .get_optional_child("subject")
                .and_then(Stanza::text)
                .map(str::to_string),
            members,
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conference {
    /// Local part of the room address.
    pub id: String,
    pub jid: String,
    /// Dialable number: the digits right before the `@`.
    pub extension: String,
    pub subject: String,
    pub participants: Vec<ConferenceParticipant>,
    pub options: IndexMap<String, String>,
}

impl Conference {
    pub fn name(&self) -> String {
        format!("{} <{}>", self.subject, self.extension)
    }

    pub fn participant(&self, id: &str) -> Option<&ConferenceParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut ConferenceParticipant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn participant_by_jid(&self, jid: &str) -> Option<&ConferenceParticipant> {
        self.participants.iter().find(|p| p.jid() == Some(jid))
    }

    /// We may moderate this room.
    pub fn is_moderator(&self) -> bool {
        self.option("role") == Some("moderator")
    }

    pub fn is_moderator_strategy(&self) -> bool {
        self.option("strategy") == Some("moderator")
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Marks every participant offline, returning them.
    pub fn reset_presence(&mut self) -> Vec<ConferenceParticipant> {
        self.participants
            .iter_mut()
            .map(|participant| {
                participant.presence = ConferencePresence::offline();
                participant.clone()
            })
            .collect()
    }
}

fn extension_of(jid: &str) -> String {
    let local = jid.split('@').next().unwrap_or_default();
    let digits = local
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(index, _)| &local[index..])
        .unwrap_or_default();
    digits.to_string()
}

impl Entity for Conference {
    type Raw = RawConference;

    fn id(&self) -> &str {
        &self.jid
    }

    fn from_raw(raw: RawConference) -> Self {
        let jid = raw.jid.unwrap_or_default();
        Self {
            id: jid.split_once('@').map(|(id, _)| id).unwrap_or_default().to_string(),
            extension: extension_of(&jid),
            subject: raw.subject.unwrap_or_else(|| "unknown".to_string()),
            participants: raw.members,
            options: raw.options,
            jid,
        }
    }

    /// Replaces the room definition. Participants that remain keep the
    /// presence last reported for them.
    fn update_from_raw(&mut self, raw: RawConference) {
        let mut members = raw.members;
        for member in &mut members {
            if let Some(previous) = self.participant(&member.id) {
                member.presence = previous.presence.clone();
            }
        }
        self.subject = raw.subject.unwrap_or_else(|| "unknown".to_string());
        self.participants = members;
        self.options = raw.options;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Stanza {
        StanzaBuilder::new("x")
            .child(StanzaBuilder::new("subject").text("Standup").build())
            .child(
                StanzaBuilder::new("options")
                    .child(
                        StanzaBuilder::new("item")
                            .attr("name", "role")
                            .attr("value", "moderator")
                            .build(),
                    )
                    .build(),
            )
            .child(
                StanzaBuilder::new("members")
                    .child(
                        StanzaBuilder::new("item")
                            .attr("id", "p1")
                            .attr("role", "moderator")
                            .child(StanzaBuilder::new("jid").text("201@pbx.local").build())
                            .build(),
                    )
                    .child(
                        StanzaBuilder::new("item")
                            .attr("id", "p2")
                            .child(StanzaBuilder::new("extension").text("+380634664426").build())
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_parse_room() {
        let raw = RawConference::from_stanza("conf-7001@conference.pbx.local", &room());
        let conference = Conference::from_raw(raw);
        assert_eq!(conference.id, "conf-7001");
        assert_eq!(conference.extension, "7001");
        assert_eq!(conference.name(), "Standup <7001>");
        assert!(conference.is_moderator());
        assert!(!conference.is_moderator_strategy());

        let p1 = conference.participant("p1").unwrap();
        assert!(p1.is_moderator());
        assert_eq!(p1.jid(), Some("201@pbx.local"));
        let p2 = conference.participant("p2").unwrap();
        assert_eq!(p2.contact, Some(ParticipantContact::Tel("+380634664426".into())));
        assert_eq!(p2.role, "participant");
        assert_eq!(conference.participant_by_jid("201@pbx.local").unwrap().id, "p1");
    }

    #[test]
    fn test_update_keeps_presence_of_remaining_participants() {
        let jid = "7001@conference.pbx.local";
        let mut conference = Conference::from_raw(RawConference::from_stanza(jid, &room()));
        conference.participant_mut("p1").unwrap().presence.online = true;

        let renamed = StanzaBuilder::new("x")
            .child(StanzaBuilder::new("subject").text("Retro").build())
            .child(
                StanzaBuilder::new("members")
                    .child(
                        StanzaBuilder::new("item")
                            .attr("id", "p1")
                            .child(StanzaBuilder::new("jid").text("201@pbx.local").build())
                            .build(),
                    )
                    .build(),
            )
            .build();
        conference.update_from_raw(RawConference::from_stanza(jid, &renamed));

        assert_eq!(conference.subject, "Retro");
        assert_eq!(conference.participants.len(), 1);
        assert!(conference.participant("p1").unwrap().presence.online);
        assert!(conference.options.is_empty());
    }

    #[test]
    fn test_presence_flags() {
        let x = StanzaBuilder::new("x")
            .child(StanzaBuilder::new("online").build())
            .child(StanzaBuilder::new("show").text("dnd").build())
            .child(StanzaBuilder::new("audio").text("muted").build())
            .child(StanzaBuilder::new("speaking").build())
            .build();
        let presence = ConferencePresence::from_stanza(&x);
        assert!(presence.online);
        assert!(presence.is_dnd());
        assert!(presence.is_audio_connected());
        assert!(!presence.audio_muted);
        assert!(presence.speaking);
        assert_eq!(ConferencePresence::offline().audio, AudioStatus::Disconnected);
    }
}
