use crate::collection::{Entity, EntityCollection, RawItem};
use crate::stanza::Stanza;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCallFlow {
    pub id: String,
    pub kind: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawQueueCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub number: Option<String>,
    pub wait_time: Option<i64>,
    pub talk_time: Option<i64>,
    pub flows: Vec<QueueCallFlow>,
}

impl RawItem for RawQueueCall {
    const KIND: &'static str = "queue call";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl RawQueueCall {
    pub fn from_stanza(node: &Stanza) -> Self {
        Self {
            id: node.attr("id").map(str::to_string),
            name: node.attr("name").map(str::to_string),
            number: node.attr("number").map(str::to_string),
            wait_time: node.attr("wait_time").and_then(parse_seconds),
            talk_time: node.attr("talk_time").and_then(parse_seconds),
            flows: node
                .descendants("flow")
                .into_iter()
                .map(|f| QueueCallFlow {
                    id: f.attr("id").unwrap_or_default().to_string(),
                    kind: f.attr("type").map(str::to_string),
                    name: f.attr("name").map(str::to_string),
                })
                .collect(),
        }
    }

    pub fn parse_all(parent: &Stanza) -> Vec<Self> {
        parent
            .descendants("call")
            .into_iter()
            .map(Self::from_stanza)
            .collect()
    }
}

/// Negative values are the server's "not started" marker.
fn parse_seconds(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|v| *v >= 0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueCall {
    pub id: String,
    pub name: String,
    pub number: String,
    pub wait_time: Option<i64>,
    pub talk_time: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub flows: Vec<QueueCallFlow>,
}

impl QueueCall {
    /// Seconds spent waiting. Keeps counting until an agent picks up.
    pub fn wait_time_at(&self, now: DateTime<Utc>) -> Option<i64> {
        let wait = self.wait_time?;
        if self.talk_time.is_none() {
            Some(wait + self.elapsed(now))
        } else {
            Some(wait)
        }
    }

    pub fn talk_time_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.talk_time.map(|talk| talk + self.elapsed(now))
    }

    fn elapsed(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.received_at.timestamp()
    }
}

impl Entity for QueueCall {
    type Raw = RawQueueCall;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_raw(raw: RawQueueCall) -> Self {
        Self {
            id: raw.id.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            number: raw.number.unwrap_or_default(),
            wait_time: raw.wait_time,
            talk_time: raw.talk_time,
            received_at: Utc::now(),
            flows: raw.flows,
        }
    }

    fn update_from_raw(&mut self, raw: RawQueueCall) {
        self.name = raw.name.unwrap_or_default();
        self.number = raw.number.unwrap_or_default();
        self.wait_time = raw.wait_time;
        self.talk_time = raw.talk_time;
        self.received_at = Utc::now();
        self.flows = raw.flows;
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawQueue {
    pub id: Option<String>,
    pub name: Option<String>,
    pub members: Vec<String>,
    pub calls: Vec<RawQueueCall>,
}

impl RawItem for RawQueue {
    const KIND: &'static str = "queue";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl RawQueue {
    pub fn from_stanza(node: &Stanza) -> Self {
        Self {
            id: node.attr("id").map(str::to_string),
            name: node.attr("name").map(str::to_string),
            members: node
                .descendants("member")
                .into_iter()
                .filter_map(|m| m.attr("jid").map(str::to_string))
                .collect(),
            calls: RawQueueCall::parse_all(node),
        }
    }

    pub fn parse_all(parent: &Stanza) -> Vec<Self> {
        parent
            .descendants("queue")
            .into_iter()
            .map(Self::from_stanza)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Queue {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    #[serde(skip)]
    pub calls: EntityCollection<QueueCall>,
}

impl Queue {
    pub fn call(&self, id: &str) -> Option<&QueueCall> {
        self.calls.get(id)
    }

    pub fn calls(&self) -> impl Iterator<Item = &QueueCall> {
        self.calls.iter()
    }
}

impl Entity for Queue {
    type Raw = RawQueue;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_raw(raw: RawQueue) -> Self {
        Self {
            id: raw.id.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            members: raw.members,
            calls: EntityCollection::from_raw_items(raw.calls),
        }
    }

    /// A queue update carries the full waiting list and replaces it.
    fn update_from_raw(&mut self, raw: RawQueue) {
        self.name = raw.name.unwrap_or_default();
        self.members = raw.members;
        self.calls = EntityCollection::from_raw_items(raw.calls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::StanzaBuilder;
    use chrono::Duration;

    fn queue_node() -> Stanza {
        StanzaBuilder::new("queue")
            .attr("id", "q1")
            .attr("name", "Support")
            .child(StanzaBuilder::new("member").attr("jid", "100@pbx.local").build())
            .child(
                StanzaBuilder::new("call")
                    .attr("id", "qc1")
                    .attr("number", "5551234")
                    .attr("wait_time", "30")
                    .attr("talk_time", "-1")
                    .child(StanzaBuilder::new("flow").attr("id", "f1").attr("type", "ivr").build())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_parse_queue_with_nested_calls() {
        let queue = Queue::from_raw(RawQueue::from_stanza(&queue_node()));
        assert_eq!(queue.name, "Support");
        assert_eq!(queue.members, vec!["100@pbx.local"]);
        let call = queue.call("qc1").unwrap();
        assert_eq!(call.wait_time, Some(30));
        assert_eq!(call.talk_time, None);
        assert_eq!(call.flows[0].kind.as_deref(), Some("ivr"));
    }

    #[test]
    fn test_wait_time_runs_until_answered() {
        let mut call = QueueCall::from_raw(RawQueueCall {
            id: Some("qc1".into()),
            wait_time: Some(30),
            ..Default::default()
        });
        let later = call.received_at + Duration::seconds(5);
        assert_eq!(call.wait_time_at(later), Some(35));
        assert_eq!(call.talk_time_at(later), None);

        call.talk_time = Some(0);
        assert_eq!(call.wait_time_at(later), Some(30));
        assert_eq!(call.talk_time_at(later), Some(5));
    }
}
