//! Call control: the live call list, per-call resources and call requests.

use crate::client::{Client, ClientError};
use crate::handlers::{SessionListener, StanzaHandler};
use crate::request::InfoQuery;
use async_trait::async_trait;
use log::{debug, warn};
use sbcore::collection::EntityCollection;
use sbcore::presence::Registration;
use sbcore::resource::{
    RawResource, Resource, ResourceFactory, ResourceHandler, ResourceInfo, ResourceScope,
};
use sbcore::session::TransportError;
use sbcore::stanza::{Stanza, StanzaBuilder, StanzaKind};
use sbcore::types::call::{Call, CallSnapshot, RawCall};
use sbcore::types::events::{CallResourceEvent, Event};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const NS_AC: &str = "urn:switchboard:ac";
pub const NS_AC_RESOURCE: &str = "urn:switchboard:ac:resource";
pub const NS_AC_REG: &str = "urn:switchboard:ac:reg";
pub const NS_AC_SPY: &str = "urn:switchboard:ac:spy";

pub(crate) const PRIORITY: i32 = 10;

#[derive(Debug, Default)]
pub struct CallsState {
    calls: EntityCollection<Call>,
    registrations: Vec<Registration>,
}

impl CallsState {
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        self.calls.iter().map(Call::snapshot).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Call> {
        self.calls.get(id)
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Applies a call-control message. Returns `None` when the message is not
    /// call traffic.
    pub fn on_message(
        &mut self,
        message: &Stanza,
        factory: &dyn ResourceFactory,
    ) -> Option<Vec<Event>> {
        if let Some(event) = message.get_child_ns("event", NS_AC) {
            let items = RawCall::parse_all(event);
            let events = match event.attr("type") {
                Some("create") | Some("state") => self.add_calls(items, factory),
                Some("update") => self.update_calls(items),
                Some("delete") => self.remove_calls(items),
                other => {
                    debug!(target: "Calls", "Ignoring call event of type {other:?}");
                    Vec::new()
                }
            };
            return Some(events);
        }

        if let Some(event) = message.get_child_ns("event", NS_AC_REG) {
            let registrations: Vec<Registration> = if event.attr("type") == Some("state") {
                event
                    .descendants("registration")
                    .into_iter()
                    .filter_map(Registration::from_stanza)
                    .collect()
            } else {
                Vec::new()
            };
            self.registrations = registrations.clone();
            return Some(vec![Event::RegistrationsChanged(registrations)]);
        }

        if let Some(event) = message.get_child_ns("event", NS_AC_RESOURCE) {
            let items: Vec<RawResource> = event
                .descendants("resource")
                .into_iter()
                .map(RawResource::from_stanza)
                .collect();
            let call_id = event.attr("call").unwrap_or_default();
            return Some(self.apply_resources(event.attr("type"), call_id, items, factory));
        }

        if let Some(exchange) = message.get_child_ns("exchange", NS_AC_RESOURCE) {
            self.route_exchange(message, exchange);
            return Some(Vec::new());
        }

        None
    }

    /// Routes an iq in the resource namespace to its resource. Returns the
    /// stanza to send back, if any.
    pub fn on_resource_iq(&mut self, iq: &Stanza) -> Option<Stanza> {
        let query = iq.query()?;
        if let (Some(id), Some(meet)) = (query.attr("id"), query.attr("meet")) {
            if let Some(call) = self.find_by_meet_mut(meet) {
                if let Some(resource) = call.resources.lookup_mut(id) {
                    return match resource.handle_iq(iq, query) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(target: "Calls/Resource", "Resource '{id}' failed on iq: {e}");
                            None
                        }
                    };
                }
            }
        }

        if matches!(iq.stanza_type(), Some("result") | Some("error")) {
            return None;
        }
        Some(iq.error_reply(400, "modify", "not-found"))
    }

    fn add_calls(&mut self, items: Vec<RawCall>, factory: &dyn ResourceFactory) -> Vec<Event> {
        let added = self
            .calls
            .apply_create_with(items, |raw| Call::from_raw_with(raw, factory));
        added
            .iter()
            .filter_map(|id| self.calls.get(id))
            .map(|call| Event::CallAdded(call.snapshot()))
            .collect()
    }

    fn update_calls(&mut self, items: Vec<RawCall>) -> Vec<Event> {
        let updates = self.calls.apply_update_with(items, |call, raw| {
            let update = call.update(&raw);
            (call.snapshot(), update)
        });

        let mut events = Vec::new();
        for (call, update) in updates {
            for resource in update.invalidated {
                events.push(Event::CallResourceRemoved(CallResourceEvent {
                    call: call.clone(),
                    resource,
                }));
            }
            events.push(Event::CallUpdated {
                call,
                previous: update.previous,
            });
        }
        events
    }

    fn remove_calls(&mut self, items: Vec<RawCall>) -> Vec<Event> {
        let mut events = Vec::new();
        for (mut call, raw) in self.calls.apply_delete(items) {
            let removed = call.terminate(raw.cause.clone());
            terminated_events(&call, removed, raw.cause, &mut events);
        }
        events
    }

    fn apply_resources(
        &mut self,
        kind: Option<&str>,
        call_id: &str,
        items: Vec<RawResource>,
        factory: &dyn ResourceFactory,
    ) -> Vec<Event> {
        let Some(call) = self.calls.get_mut(call_id) else {
            debug!(target: "Calls/Resource", "Resource event for unknown call '{call_id}'");
            return Vec::new();
        };

        let (changed, wrap): (Vec<ResourceInfo>, fn(CallResourceEvent) -> Event) = match kind {
            Some("create") => (
                call.resources
                    .add_resources(items, |raw| factory.create_handler(call_id, raw)),
                Event::CallResourceAdded,
            ),
            Some("update") => (
                call.resources.update_resources(items),
                Event::CallResourceUpdated,
            ),
            Some("delete") => (
                call.resources.remove_resources(items),
                Event::CallResourceRemoved,
            ),
            other => {
                debug!(target: "Calls/Resource", "Ignoring resource event of type {other:?}");
                return Vec::new();
            }
        };

        let snapshot = call.snapshot();
        changed
            .into_iter()
            .map(|resource| {
                wrap(CallResourceEvent {
                    call: snapshot.clone(),
                    resource,
                })
            })
            .collect()
    }

    fn route_exchange(&mut self, message: &Stanza, exchange: &Stanza) {
        let (Some(id), Some(meet)) = (exchange.attr("id"), exchange.attr("meet")) else {
            return;
        };
        let Some(resource) = self
            .find_by_meet_mut(meet)
            .and_then(|call| call.resources.lookup_mut(id))
        else {
            debug!(target: "Calls/Resource", "Exchange for unknown resource '{id}'");
            return;
        };
        if let Err(e) = resource.handle_message(message, exchange) {
            warn!(target: "Calls/Resource", "Resource '{id}' failed on exchange: {e}");
        }
    }

    fn find_by_meet_mut(&mut self, meet: &str) -> Option<&mut Call> {
        self.calls
            .find_mut(|call| call.details.meet.as_deref() == Some(meet))
    }

    /// Session loss: destroys every resource and marks every call down, then
    /// empties the call list and the registrations.
    pub fn teardown(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        for call in self.calls.iter_mut() {
            let removed = call.terminate(None);
            let cause = call.details.cause.clone();
            terminated_events(call, removed, cause, &mut events);
        }
        self.calls.drain();
        self.registrations.clear();
        events
    }
}

fn terminated_events(
    call: &Call,
    removed: Vec<ResourceInfo>,
    cause: Option<String>,
    events: &mut Vec<Event>,
) {
    let snapshot = call.snapshot();
    for resource in removed {
        events.push(Event::CallResourceRemoved(CallResourceEvent {
            call: snapshot.clone(),
            resource,
        }));
    }
    events.push(Event::CallTerminated {
        call: snapshot,
        cause,
    });
}

struct CallsHandler {
    state: Arc<Mutex<CallsState>>,
    factory: Arc<dyn ResourceFactory>,
}

impl CallsHandler {
    fn lock(&self) -> MutexGuard<'_, CallsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StanzaHandler for CallsHandler {
    async fn handle(&self, client: &Arc<Client>, stanza: &Stanza) -> bool {
        match stanza.kind() {
            Some(StanzaKind::Message) => {
                let events = self.lock().on_message(stanza, self.factory.as_ref());
                match events {
                    Some(events) => {
                        events.into_iter().for_each(|e| client.dispatch_event(e));
                        true
                    }
                    None => false,
                }
            }
            Some(StanzaKind::Iq) if stanza.query_xmlns() == Some(NS_AC_RESOURCE) => {
                let reply = self.lock().on_resource_iq(stanza);
                if let Some(reply) = reply {
                    if let Err(e) = client.send(&reply).await {
                        warn!(target: "Calls/Resource", "Failed to answer resource iq: {e}");
                    }
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SessionListener for CallsHandler {
    async fn on_disconnected(&self, client: &Arc<Client>, _error: Option<&TransportError>) {
        let events = self.lock().teardown();
        events.into_iter().for_each(|e| client.dispatch_event(e));
    }
}

/// Call-control module.
#[derive(Clone)]
pub struct Calls {
    client: Arc<Client>,
    state: Arc<Mutex<CallsState>>,
    factory: Arc<dyn ResourceFactory>,
}

impl Calls {
    pub fn new(client: Arc<Client>, factory: Arc<dyn ResourceFactory>) -> Self {
        let state = Arc::new(Mutex::new(CallsState::default()));
        let handler = Arc::new(CallsHandler {
            state: state.clone(),
            factory: factory.clone(),
        });
        client.register_handler(StanzaKind::Message, PRIORITY, handler.clone());
        client.register_handler(StanzaKind::Iq, PRIORITY, handler.clone());
        client.add_session_listener(handler);

        Self {
            client,
            state,
            factory,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<CallSnapshot> {
        self.lock().snapshots()
    }

    pub fn call(&self, id: &str) -> Option<CallSnapshot> {
        self.lock().get(id).map(Call::snapshot)
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().registrations().to_vec()
    }

    pub fn resource_factory(&self) -> &Arc<dyn ResourceFactory> {
        &self.factory
    }

    async fn action(&self, action: &str, attrs: &[(&str, &str)]) -> Result<Stanza, ClientError> {
        let node = StanzaBuilder::new(action)
            .attrs(attrs.iter().copied())
            .build();
        Ok(self.client.send_iq(InfoQuery::set(NS_AC).child(node)).await?)
    }

    /// Rings every registered device, then dials `to`.
    pub async fn originate(&self, to: &str) -> Result<Stanza, ClientError> {
        self.action("originate", &[("to", to), ("type", "invite-all")])
            .await
    }

    pub async fn originate_using_registration(
        &self,
        to: &str,
        registration: &Registration,
    ) -> Result<Stanza, ClientError> {
        self.action(
            "originate",
            &[
                ("to", to),
                ("registration", registration.id.as_str()),
                ("type", "invite-one"),
            ],
        )
        .await
    }

    /// Rings an external `number` first, then dials `to`.
    pub async fn originate_using_mobility(
        &self,
        to: &str,
        number: &str,
    ) -> Result<Stanza, ClientError> {
        self.action(
            "originate",
            &[("to", to), ("number", number), ("type", "mobility")],
        )
        .await
    }

    pub async fn answer(&self, call: &str, channel: &str) -> Result<Stanza, ClientError> {
        self.action("answer", &[("call", call), ("channel", channel)])
            .await
    }

    pub async fn hangup(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("hangup", &[("call", call)]).await
    }

    pub async fn decline(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("decline", &[("call", call)]).await
    }

    pub async fn hold(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("hold", &[("call", call)]).await
    }

    pub async fn resume(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("resume", &[("call", call)]).await
    }

    pub async fn mute(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("mute", &[("call", call)]).await
    }

    pub async fn unmute(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("unmute", &[("call", call)]).await
    }

    pub async fn forward(&self, call: &str, to: &str) -> Result<Stanza, ClientError> {
        self.action("forward", &[("call", call), ("to", to)]).await
    }

    pub async fn bridge(&self, call1: &str, call2: &str) -> Result<Stanza, ClientError> {
        self.action("bridge", &[("call1", call1), ("call2", call2)])
            .await
    }

    pub async fn dtmf(&self, call: &str, key: &str) -> Result<Stanza, ClientError> {
        self.action("dtmf", &[("call", call), ("key", key)]).await
    }

    pub async fn start_record(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("record-start", &[("call", call)]).await
    }

    pub async fn stop_record(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("record-stop", &[("call", call)]).await
    }

    /// Lists the calls of a colleague. The result is not merged into the
    /// local call list.
    pub async fn spy(&self, jid: &str) -> Result<Vec<CallSnapshot>, ClientError> {
        let reply = self
            .client
            .send_iq(InfoQuery::get(NS_AC_SPY).attr("jid", jid))
            .await?;
        Ok(RawCall::parse_all(&reply)
            .into_iter()
            .map(|raw| Call::from_raw_with(raw, self.factory.as_ref()).snapshot())
            .collect())
    }

    pub async fn spy_pickup(
        &self,
        call: &str,
        registration: &Registration,
    ) -> Result<Stanza, ClientError> {
        self.action(
            "spy-pickup",
            &[("call", call), ("registration", registration.id.as_str())],
        )
        .await
    }

    pub async fn spy_intrusion(
        &self,
        call: &str,
        registration: &Registration,
    ) -> Result<Stanza, ClientError> {
        self.action(
            "spy-intrusion",
            &[("call", call), ("registration", registration.id.as_str())],
        )
        .await
    }

    pub async fn spy_decline(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("spy-decline", &[("call", call)]).await
    }

    pub async fn spy_terminate(&self, call: &str) -> Result<Stanza, ClientError> {
        self.action("spy-terminate", &[("call", call)]).await
    }

    /// Publishes a resource of our own into a call. On success the resource
    /// joins the call's "mine" namespace and `handler` starts receiving its
    /// traffic; otherwise `handler` is destroyed.
    pub async fn share(
        &self,
        call: &str,
        id: &str,
        kind: &str,
        data: Option<&str>,
        handler: Box<dyn ResourceHandler>,
    ) -> Result<ResourceInfo, ClientError> {
        let payload = data.map(|data| {
            StanzaBuilder::new("payload")
                .child(StanzaBuilder::new("data").text(data).build())
                .build()
        });
        let owner = self.client.identity().await.full_jid();
        let resource = Resource::new(
            id,
            kind,
            owner,
            ResourceScope::Mine,
            payload.clone(),
            handler,
        );

        let known = self.lock().get(call).map(|entry| entry.resources.get_mine(id).is_some());
        match known {
            None => {
                resource.destroy();
                return Err(ClientError::UnknownCall(call.to_string()));
            }
            Some(true) => {
                resource.destroy();
                return Err(ClientError::AlreadyShared {
                    call: call.to_string(),
                    id: id.to_string(),
                });
            }
            Some(false) => {}
        }

        let mut node = StanzaBuilder::new("share")
            .attr("call", call)
            .attr("id", id)
            .attr("type", kind);
        if let Some(payload) = payload {
            node = node.child(payload);
        }
        if let Err(e) = self
            .client
            .send_iq(InfoQuery::set(NS_AC).child(node.build()))
            .await
        {
            resource.destroy();
            return Err(e.into());
        }

        let event = {
            let mut state = self.lock();
            let Some(entry) = state.calls.get_mut(call) else {
                resource.destroy();
                return Err(ClientError::UnknownCall(call.to_string()));
            };
            let info = resource.info();
            if entry.resources.get_mine(id).is_some() {
                resource.destroy();
                return Err(ClientError::AlreadyShared {
                    call: call.to_string(),
                    id: id.to_string(),
                });
            }
            entry.resources.add_mine(resource);
            CallResourceEvent {
                call: entry.snapshot(),
                resource: info,
            }
        };
        let info = event.resource.clone();
        self.client.dispatch_event(Event::CallResourceAdded(event));
        Ok(info)
    }

    /// Withdraws a resource we shared and destroys it.
    pub async fn drop_resource(&self, call: &str, id: &str) -> Result<(), ClientError> {
        {
            let state = self.lock();
            let entry = state
                .get(call)
                .ok_or_else(|| ClientError::UnknownCall(call.to_string()))?;
            if entry.resources.get_mine(id).is_none() {
                return Err(ClientError::UnknownResource {
                    call: call.to_string(),
                    id: id.to_string(),
                });
            }
        }

        let node = StanzaBuilder::new("drop")
            .attr("call", call)
            .attr("id", id)
            .build();
        self.client.send_iq(InfoQuery::set(NS_AC).child(node)).await?;

        let event = {
            let mut state = self.lock();
            state.calls.get_mut(call).and_then(|entry| {
                let resource = entry.resources.remove_mine(id)?;
                Some(CallResourceEvent {
                    call: entry.snapshot(),
                    resource,
                })
            })
        };
        if let Some(event) = event {
            self.client.dispatch_event(Event::CallResourceRemoved(event));
        }
        Ok(())
    }

    /// Asks the owner of a shared resource to start streaming it to us.
    pub async fn consume(&self, call: &str, resource: &str) -> Result<Stanza, ClientError> {
        self.resource_request(call, resource, "consume").await
    }

    pub async fn unconsume(&self, call: &str, resource: &str) -> Result<Stanza, ClientError> {
        self.resource_request(call, resource, "unconsume").await
    }

    async fn resource_request(
        &self,
        call: &str,
        resource: &str,
        action: &str,
    ) -> Result<Stanza, ClientError> {
        let (meet, owner) = {
            let state = self.lock();
            let entry = state
                .get(call)
                .ok_or_else(|| ClientError::UnknownCall(call.to_string()))?;
            let meet = entry
                .details
                .meet
                .clone()
                .ok_or_else(|| ClientError::NoMeet(call.to_string()))?;
            let owner = entry
                .resources
                .get_shared(resource)
                .map(|r| r.owner().to_string())
                .ok_or_else(|| ClientError::UnknownResource {
                    call: call.to_string(),
                    id: resource.to_string(),
                })?;
            (meet, owner)
        };

        let query = InfoQuery::get(NS_AC_RESOURCE)
            .to(owner)
            .attr("id", resource)
            .attr("meet", meet)
            .child(StanzaBuilder::new(action).build());
        Ok(self.client.send_iq(query).await?)
    }
}
