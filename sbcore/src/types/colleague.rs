use crate::collection::{Entity, RawItem};
use crate::stanza::Stanza;
use serde::Serialize;

/// A vCard-like `key`/`type`/`value` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactProperty {
    pub key: String,
    pub kind: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawColleague {
    pub id: Option<String>,
    pub jid: Option<String>,
    pub extension: Option<String>,
    pub group: Option<String>,
    pub properties: Vec<ContactProperty>,
}

impl RawItem for RawColleague {
    const KIND: &'static str = "colleague";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl RawColleague {
    pub fn from_stanza(node: &Stanza) -> Self {
        Self {
            id: node.attr("id").map(str::to_string),
            jid: node.attr("jid").map(str::to_string),
            extension: node.attr("extension").map(str::to_string),
            group: node.attr("group").map(str::to_string),
            properties: node
                .descendants("property")
                .into_iter()
                .filter_map(|p| {
                    Some(ContactProperty {
                        key: p.attr("key")?.to_string(),
                        kind: p.attr("type").map(str::to_string),
                        value: p.text().unwrap_or_default().to_string(),
                    })
                })
                .collect(),
        }
    }

    pub fn parse_all(parent: &Stanza) -> Vec<Self> {
        parent
            .descendants("colleague")
            .into_iter()
            .map(Self::from_stanza)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Colleague {
    pub id: String,
    /// Bare address presence stanzas arrive from.
    pub jid: String,
    pub extension: String,
    pub group: Option<String>,
    pub properties: Vec<ContactProperty>,
}

impl Colleague {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// `"FN <TEL>"`, falling back to whichever is present, then the extension.
    pub fn display_name(&self) -> String {
        let tel: Vec<&str> = self
            .properties
            .iter()
            .filter(|p| p.key == "TEL")
            .map(|p| p.value.as_str())
            .collect();
        let tel = tel.join(", ");
        match (self.property("FN"), tel.is_empty()) {
            (Some(name), false) => format!("{name} <{tel}>"),
            (Some(name), true) => name.to_string(),
            (None, false) => tel,
            (None, true) => self.extension.clone(),
        }
    }
}

impl Entity for Colleague {
    type Raw = RawColleague;

    fn id(&self) -> &str {
        &self.id
    }

    fn from_raw(raw: RawColleague) -> Self {
        Self {
            id: raw.id.unwrap_or_default(),
            jid: raw.jid.unwrap_or_default(),
            extension: raw.extension.unwrap_or_default(),
            group: raw.group,
            properties: raw.properties,
        }
    }

    fn update_from_raw(&mut self, raw: RawColleague) {
        if let Some(jid) = raw.jid {
            self.jid = jid;
        }
        if let Some(extension) = raw.extension {
            self.extension = extension;
        }
        self.group = raw.group;
        self.properties = raw.properties;
    }
}
