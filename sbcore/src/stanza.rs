//! A minimal owned stanza tree.
//!
//! The wire codec lives outside this crate; transports hand us already-parsed
//! trees and accept trees for sending. Only the lookups the synchronizers need
//! are provided here.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// The three inbound packet classes a session delivers to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    Presence,
    Message,
    Iq,
}

impl StanzaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Presence => "presence",
            StanzaKind::Message => "message",
            StanzaKind::Iq => "iq",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "presence" => Some(StanzaKind::Presence),
            "message" => Some(StanzaKind::Message),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StanzaContent {
    Text(String),
    Children(Vec<Stanza>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stanza {
    pub tag: String,
    pub attrs: IndexMap<String, String>,
    pub content: Option<StanzaContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    #[error("missing required attribute '{0}'")]
    MissingAttr(String),
    #[error("attribute '{key}' has invalid value '{value}'")]
    InvalidAttr { key: String, value: String },
    #[error("attribute errors: {0:?}")]
    Attrs(Vec<StanzaError>),
}

impl Stanza {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Option<StanzaKind> {
        StanzaKind::from_tag(&self.tag)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    pub fn attrs(&self) -> AttrParser<'_> {
        AttrParser::new(self)
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn xmlns(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    pub fn children(&self) -> &[Stanza] {
        match &self.content {
            Some(StanzaContent::Children(children)) => children,
            _ => &[],
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Some(StanzaContent::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_optional_child(&self, tag: &str) -> Option<&Stanza> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// Direct child with the given tag declared in the given namespace.
    pub fn get_child_ns(&self, tag: &str, xmlns: &str) -> Option<&Stanza> {
        self.children()
            .iter()
            .find(|c| c.tag == tag && c.xmlns() == Some(xmlns))
    }

    /// The `<query/>` payload of an iq.
    pub fn query(&self) -> Option<&Stanza> {
        self.get_optional_child("query")
    }

    pub fn query_xmlns(&self) -> Option<&str> {
        self.query().and_then(Stanza::xmlns)
    }

    /// All descendants with the given tag, depth-first in document order.
    pub fn descendants<'a>(&'a self, tag: &str) -> Vec<&'a Stanza> {
        let mut found = Vec::new();
        collect_descendants(self, tag, &mut found);
        found
    }

    pub fn push_child(&mut self, child: Stanza) {
        match &mut self.content {
            Some(StanzaContent::Children(children)) => children.push(child),
            _ => self.content = Some(StanzaContent::Children(vec![child])),
        }
    }

    /// Builds an `iq type="error"` reply addressed back to the sender.
    pub fn error_reply(&self, code: u16, error_type: &str, condition: &str) -> Stanza {
        let mut builder = StanzaBuilder::new(self.tag.clone()).attr("type", "error");
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if let Some(from) = self.attr("from") {
            builder = builder.attr("to", from);
        }
        if let Some(to) = self.attr("to") {
            builder = builder.attr("from", to);
        }

        let error = StanzaBuilder::new("error")
            .attr("code", code.to_string())
            .attr("type", error_type)
            .child(StanzaBuilder::new(condition).attr("xmlns", NS_STANZAS).build())
            .build();

        let mut children: Vec<Stanza> = self.children().to_vec();
        children.push(error);
        builder.children(children).build()
    }
}

fn collect_descendants<'a>(node: &'a Stanza, tag: &str, found: &mut Vec<&'a Stanza>) {
    for child in node.children() {
        if child.tag == tag {
            found.push(child);
        }
        collect_descendants(child, tag, found);
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attrs {
            write!(f, " {}=\"{}\"", key, escape(value))?;
        }
        match &self.content {
            None => write!(f, "/>"),
            Some(StanzaContent::Text(text)) => write!(f, ">{}</{}>", escape(text), self.tag),
            Some(StanzaContent::Children(children)) => {
                write!(f, ">")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug, Default)]
pub struct StanzaBuilder {
    tag: String,
    attrs: IndexMap<String, String>,
    content: Option<StanzaContent>,
}

impl StanzaBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attrs<I, K, V>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in attrs.into_iter() {
            self.attrs.insert(key.into(), value.into());
        }
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Stanza>) -> Self {
        self.content = Some(StanzaContent::Children(children.into_iter().collect()));
        self
    }

    pub fn child(mut self, child: Stanza) -> Self {
        match &mut self.content {
            Some(StanzaContent::Children(children)) => children.push(child),
            _ => self.content = Some(StanzaContent::Children(vec![child])),
        }
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.content = Some(StanzaContent::Text(text.into()));
        self
    }

    pub fn build(self) -> Stanza {
        Stanza {
            tag: self.tag,
            attrs: self.attrs,
            content: self.content,
        }
    }
}

/// Attribute reader that collects errors instead of failing on the first one.
pub struct AttrParser<'a> {
    node: &'a Stanza,
    pub errors: Vec<StanzaError>,
}

impl<'a> AttrParser<'a> {
    pub fn new(node: &'a Stanza) -> Self {
        Self {
            node,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> Result<(), StanzaError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(StanzaError::Attrs(self.errors))
        }
    }

    pub fn optional_string(&mut self, key: &str) -> Option<&'a str> {
        self.node.attrs.get(key).map(String::as_str)
    }

    pub fn string(&mut self, key: &str) -> String {
        match self.optional_string(key) {
            Some(value) => value.to_string(),
            None => {
                self.errors.push(StanzaError::MissingAttr(key.to_string()));
                String::new()
            }
        }
    }

    pub fn optional_i64(&mut self, key: &str) -> Option<i64> {
        let value = self.optional_string(key)?;
        match value.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push(StanzaError::InvalidAttr {
                    key: key.to_string(),
                    value: value.to_string(),
                });
                None
            }
        }
    }

    pub fn optional_u64(&mut self, key: &str) -> Option<u64> {
        let value = self.optional_string(key)?;
        match value.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push(StanzaError::InvalidAttr {
                    key: key.to_string(),
                    value: value.to_string(),
                });
                None
            }
        }
    }
}
