//! Per-call child resources and their destroy lifecycle.
//!
//! A [`Resource`] owns its handler. Destroying consumes the resource, so a
//! handler's `on_destroy` runs at most once by construction, and every removal
//! path in [`ResourceSet`] goes through [`Resource::destroy`], so it runs at
//! least once too. Handler failures and panics are logged and swallowed.

use crate::collection::RawItem;
use crate::stanza::Stanza;
use indexmap::IndexMap;
use log::{error, warn};
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource handler failed: {0}")]
    Handler(String),
    #[error("resource handler panicked")]
    Panicked,
    #[error("unknown resource '{0}'")]
    Unknown(String),
}

/// Capabilities every resource variant provides.
pub trait ResourceHandler: Send {
    /// An inbound iq addressed to this resource. A returned stanza is sent
    /// back as the reply.
    fn on_iq(&mut self, iq: &Stanza, query: &Stanza) -> Result<Option<Stanza>, ResourceError>;

    /// An `exchange` message relayed by a peer.
    fn on_message(&mut self, message: &Stanza, exchange: &Stanza) -> Result<(), ResourceError>;

    /// Called exactly once when the resource leaves its call.
    fn on_destroy(&mut self) -> Result<(), ResourceError>;
}

/// Handler for resources nobody locally cares about.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveHandler;

impl ResourceHandler for PassiveHandler {
    fn on_iq(&mut self, _iq: &Stanza, _query: &Stanza) -> Result<Option<Stanza>, ResourceError> {
        Ok(None)
    }

    fn on_message(&mut self, _message: &Stanza, _exchange: &Stanza) -> Result<(), ResourceError> {
        Ok(())
    }

    fn on_destroy(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Supplies handlers for resources shared by other participants.
pub trait ResourceFactory: Send + Sync {
    fn create_handler(&self, call_id: &str, raw: &RawResource) -> Box<dyn ResourceHandler>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveFactory;

impl ResourceFactory for PassiveFactory {
    fn create_handler(&self, _call_id: &str, _raw: &RawResource) -> Box<dyn ResourceHandler> {
        Box::new(PassiveHandler)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawResource {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub owner: Option<String>,
    pub payload: Option<Stanza>,
}

impl RawItem for RawResource {
    const KIND: &'static str = "resource";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl RawResource {
    /// Reads a `<resource id type owner><payload/></resource>` element.
    pub fn from_stanza(node: &Stanza) -> Self {
        Self {
            id: node.attr("id").map(str::to_string),
            kind: node.attr("type").map(str::to_string),
            owner: node.attr("owner").map(str::to_string),
            payload: node.descendants("payload").first().map(|p| (*p).clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceScope {
    /// Published by another participant and consumed here.
    Shared,
    /// Published by this client.
    Mine,
}

/// Handler-free view of a resource, carried in events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: String,
    pub kind: String,
    pub owner: String,
    pub scope: ResourceScope,
    #[serde(skip)]
    pub payload: Option<Stanza>,
}

pub struct Resource {
    id: String,
    kind: String,
    owner: String,
    scope: ResourceScope,
    payload: Option<Stanza>,
    handler: Box<dyn ResourceHandler>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        owner: impl Into<String>,
        scope: ResourceScope,
        payload: Option<Stanza>,
        handler: Box<dyn ResourceHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            owner: owner.into(),
            scope,
            payload,
            handler,
        }
    }

    fn shared(raw: RawResource, handler: Box<dyn ResourceHandler>) -> Self {
        Self::new(
            raw.id.unwrap_or_default(),
            raw.kind.unwrap_or_default(),
            raw.owner.unwrap_or_default(),
            ResourceScope::Shared,
            raw.payload,
            handler,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn scope(&self) -> ResourceScope {
        self.scope
    }

    pub fn payload(&self) -> Option<&Stanza> {
        self.payload.as_ref()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id.clone(),
            kind: self.kind.clone(),
            owner: self.owner.clone(),
            scope: self.scope,
            payload: self.payload.clone(),
        }
    }

    pub fn handle_iq(
        &mut self,
        iq: &Stanza,
        query: &Stanza,
    ) -> Result<Option<Stanza>, ResourceError> {
        let handler = &mut self.handler;
        catch_unwind(AssertUnwindSafe(|| handler.on_iq(iq, query)))
            .unwrap_or(Err(ResourceError::Panicked))
    }

    pub fn handle_message(
        &mut self,
        message: &Stanza,
        exchange: &Stanza,
    ) -> Result<(), ResourceError> {
        let handler = &mut self.handler;
        catch_unwind(AssertUnwindSafe(|| handler.on_message(message, exchange)))
            .unwrap_or(Err(ResourceError::Panicked))
    }

    /// Runs the destroy callback and returns what the resource looked like.
    pub fn destroy(mut self) -> ResourceInfo {
        let info = self.info();
        let handler = &mut self.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_destroy()))
            .unwrap_or(Err(ResourceError::Panicked));
        if let Err(e) = outcome {
            error!(target: "Calls/Resource", "Destroying resource '{}' failed: {e}", info.id);
        }
        info
    }
}

/// The two disjoint resource namespaces of one call.
#[derive(Debug, Default)]
pub struct ResourceSet {
    shared: IndexMap<String, Resource>,
    mine: IndexMap<String, Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.mine.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.len() + self.mine.len()
    }

    pub fn shared(&self) -> impl Iterator<Item = &Resource> {
        self.shared.values()
    }

    pub fn mine(&self) -> impl Iterator<Item = &Resource> {
        self.mine.values()
    }

    /// Views of every resource, mine first.
    pub fn infos(&self) -> Vec<ResourceInfo> {
        self.mine
            .values()
            .chain(self.shared.values())
            .map(Resource::info)
            .collect()
    }

    /// Adds shared resources, building a handler for each new id.
    pub fn add_resources(
        &mut self,
        items: impl IntoIterator<Item = RawResource>,
        mut handler_for: impl FnMut(&RawResource) -> Box<dyn ResourceHandler>,
    ) -> Vec<ResourceInfo> {
        let mut added = Vec::new();
        for raw in items {
            let id = match raw.checked_id() {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(target: "Calls/Resource", "Dropping resource: {e}");
                    continue;
                }
            };
            if self.shared.contains_key(&id) {
                continue;
            }
            let handler = handler_for(&raw);
            let resource = Resource::shared(raw, handler);
            added.push(resource.info());
            self.shared.insert(id, resource);
        }
        added
    }

    /// Replaces the payload of known shared resources; unknown ids are dropped.
    pub fn update_resources(
        &mut self,
        items: impl IntoIterator<Item = RawResource>,
    ) -> Vec<ResourceInfo> {
        let mut updated = Vec::new();
        for raw in items {
            let Some(resource) = raw.id().and_then(|id| self.shared.get_mut(id)) else {
                continue;
            };
            resource.payload = raw.payload;
            updated.push(resource.info());
        }
        updated
    }

    /// Removes and destroys the listed shared resources.
    pub fn remove_resources(
        &mut self,
        items: impl IntoIterator<Item = RawResource>,
    ) -> Vec<ResourceInfo> {
        items
            .into_iter()
            .filter_map(|raw| raw.id().and_then(|id| self.shared.shift_remove(id)))
            .map(Resource::destroy)
            .collect()
    }

    pub fn add_mine(&mut self, resource: Resource) -> bool {
        if self.mine.contains_key(resource.id()) {
            return false;
        }
        self.mine.insert(resource.id().to_string(), resource);
        true
    }

    pub fn remove_mine(&mut self, id: &str) -> Option<ResourceInfo> {
        self.mine.shift_remove(id).map(Resource::destroy)
    }

    /// Destroys every resource, mine first, leaving both namespaces empty.
    pub fn destroy_all(&mut self) -> Vec<ResourceInfo> {
        let mine = std::mem::take(&mut self.mine);
        let shared = std::mem::take(&mut self.shared);
        mine.into_values()
            .chain(shared.into_values())
            .map(Resource::destroy)
            .collect()
    }

    /// Resolves an id for inbound traffic, shared namespace first.
    pub fn lookup_mut(&mut self, id: &str) -> Option<&mut Resource> {
        if self.shared.contains_key(id) {
            return self.shared.get_mut(id);
        }
        self.mine.get_mut(id)
    }

    pub fn get_shared(&self, id: &str) -> Option<&Resource> {
        self.shared.get(id)
    }

    pub fn get_mine(&self, id: &str) -> Option<&Resource> {
        self.mine.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    struct Counting {
        destroyed: Arc<AtomicUsize>,
        behaviour: Behaviour,
        tag: &'static str,
    }

    impl ResourceHandler for Counting {
        fn on_iq(
            &mut self,
            _iq: &Stanza,
            _query: &Stanza,
        ) -> Result<Option<Stanza>, ResourceError> {
            Ok(Some(Stanza::new(self.tag)))
        }

        fn on_message(
            &mut self,
            _message: &Stanza,
            _exchange: &Stanza,
        ) -> Result<(), ResourceError> {
            Ok(())
        }

        fn on_destroy(&mut self) -> Result<(), ResourceError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(ResourceError::Handler("boom".into())),
                Behaviour::Panic => panic!("handler blew up"),
            }
        }
    }

    fn raw(id: &str) -> RawResource {
        RawResource {
            id: Some(id.to_string()),
            kind: Some("screen".into()),
            owner: Some("200@pbx.local/web".into()),
            payload: None,
        }
    }

    fn counting(destroyed: &Arc<AtomicUsize>, behaviour: Behaviour) -> Box<dyn ResourceHandler> {
        Box::new(Counting {
            destroyed: destroyed.clone(),
            behaviour,
            tag: "shared",
        })
    }

    #[test]
    fn test_destroy_all_runs_every_handler_once_despite_failures() {
        let _ = env_logger::builder().is_test(true).try_init();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut set = ResourceSet::new();

        let behaviours = [Behaviour::Fail, Behaviour::Panic, Behaviour::Ok];
        let mut next = behaviours.iter();
        set.add_resources(vec![raw("a"), raw("b"), raw("c")], |_| {
            counting(&destroyed, *next.next().unwrap_or(&Behaviour::Ok))
        });
        set.add_mine(Resource::new(
            "m1",
            "screen",
            "100@pbx.local/web",
            ResourceScope::Mine,
            None,
            counting(&destroyed, Behaviour::Ok),
        ));

        let removed = set.destroy_all();
        assert_eq!(removed.len(), 4);
        assert_eq!(removed[0].id, "m1");
        assert_eq!(destroyed.load(Ordering::SeqCst), 4);
        assert!(set.is_empty());

        assert!(set.destroy_all().is_empty());
        assert_eq!(destroyed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_remove_resources_destroys_only_listed() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut set = ResourceSet::new();
        set.add_resources(vec![raw("a"), raw("b")], |_| counting(&destroyed, Behaviour::Fail));

        let removed = set.remove_resources(vec![raw("a"), raw("zzz")]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "a");
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(set.get_shared("b").is_some());
    }

    #[test]
    fn test_add_is_idempotent_and_update_ignores_unknown() {
        let mut set = ResourceSet::new();
        assert_eq!(set.add_resources(vec![raw("a")], |_| Box::new(PassiveHandler)).len(), 1);
        assert!(set.add_resources(vec![raw("a")], |_| Box::new(PassiveHandler)).is_empty());

        let mut changed = raw("a");
        changed.payload = Some(Stanza::new("payload"));
        let updated = set.update_resources(vec![changed, raw("ghost")]);
        assert_eq!(updated.len(), 1);
        assert_eq!(set.get_shared("a").unwrap().payload().unwrap().tag, "payload");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_lookup_prefers_shared_namespace() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut set = ResourceSet::new();
        set.add_mine(Resource::new(
            "x",
            "screen",
            "me",
            ResourceScope::Mine,
            None,
            Box::new(Counting {
                destroyed: destroyed.clone(),
                behaviour: Behaviour::Ok,
                tag: "mine",
            }),
        ));
        set.add_resources(vec![raw("x")], |_| {
            Box::new(Counting {
                destroyed: destroyed.clone(),
                behaviour: Behaviour::Ok,
                tag: "shared",
            })
        });

        let iq = Stanza::new("iq");
        let query = Stanza::new("query");
        let resource = set.lookup_mut("x").unwrap();
        assert_eq!(resource.scope(), ResourceScope::Shared);
        let reply = resource.handle_iq(&iq, &query).unwrap().unwrap();
        assert_eq!(reply.tag, "shared");

        set.remove_resources(vec![raw("x")]);
        let resource = set.lookup_mut("x").unwrap();
        assert_eq!(resource.scope(), ResourceScope::Mine);
    }

    #[test]
    fn test_remove_mine_destroys_once() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut set = ResourceSet::new();
        set.add_mine(Resource::new(
            "m",
            "screen",
            "me",
            ResourceScope::Mine,
            None,
            counting(&destroyed, Behaviour::Ok),
        ));
        assert!(set.remove_mine("m").is_some());
        assert!(set.remove_mine("m").is_none());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_resource_element() {
        let node = crate::stanza::StanzaBuilder::new("resource")
            .attr("id", "r1")
            .attr("type", "screen")
            .attr("owner", "200@pbx.local/web")
            .child(crate::stanza::StanzaBuilder::new("payload").text("{}").build())
            .build();
        let raw = RawResource::from_stanza(&node);
        assert_eq!(raw.id.as_deref(), Some("r1"));
        assert_eq!(raw.kind.as_deref(), Some("screen"));
        assert_eq!(raw.payload.unwrap().text(), Some("{}"));
    }
}
