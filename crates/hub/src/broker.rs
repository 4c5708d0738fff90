//! The topic registry and broker.
//!
//! The broker owns the topic-name → [`TopicEntry`] map and implements
//! subscribe/unsubscribe/publish/request/error propagation on top of it. All
//! state lives in one [`Broker`] value owned by a single task; consumers
//! talk to it through the cloneable [`Hub`] handle, whose commands are
//! processed one at a time. Deliveries scheduled by an operation run only
//! after that operation completes, which preserves caller-completes-first
//! ordering even for cache hits.
//!
//! Most subscriptions must not incur a network round trip when data is
//! already resident: subscribing to a cached topic delivers the cached value
//! directly, and only the first subscriber of a non-local topic causes a
//! `subscribe` frame.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use protocol::{ErrorMsg, Filter, Frame, Payload};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use uuid::Uuid;

use crate::auth::{authenticate_topic, login_topic, Credentials, SessionAuth};
use crate::config::Config;
use crate::error::{HubError, Result};
use crate::resolver::TopicResolver;
use crate::topic::{
    invoke_data_callback, invoke_error_callback, CallbackId, DataCallback, Delivery,
    DeliveryQueue, ErrorCallback, TopicEntry, ValidateCallback,
};
use crate::transport::{TransportClient, TransportConfig, TransportEvent};

/// Reserved local topic receiving every server-reported error.
pub const TOPIC_ERRORS: &str = "app:errors:";

/// Reserved local topic receiving a copy of every publish.
pub const TOPIC_ANY: &str = "app:any:";

/// Reserved local topic carrying connection lost/restored notices.
pub const TOPIC_CONNECTION: &str = "app:connection:";

/// Returns whether a resolved topic is local to the client.
///
/// Local topics never produce transport frames; they act as process-wide
/// shared state.
pub fn is_local(topic: &str) -> bool {
    topic.starts_with("app:")
}

/// Opaque subscription handle, required to unsubscribe.
///
/// The handle identifies the exact callback instances registered by one
/// subscribe or request call; callbacks are never compared by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// App the subscription was created under.
    pub app_name: String,
    /// Topic name as given by the subscriber.
    pub topic: String,
    /// Identifier of the registered callbacks.
    pub id: CallbackId,
}

/// Sink for outbound frames.
///
/// The transport client implements this; tests substitute a recorder to
/// account for exactly which frames an operation produced.
pub trait FrameSink: Send {
    /// Hands one frame to the transport. The transport queues it if the
    /// connection is not open.
    fn send(&self, frame: Frame);
}

/// Commands processed by the broker task.
pub enum Command {
    /// Register a subscription.
    Subscribe {
        name: String,
        on_data: DataCallback,
        on_error: Option<ErrorCallback>,
        filter: Option<Filter>,
        reply: oneshot::Sender<Token>,
    },
    /// Remove the callbacks registered under a token.
    Unsubscribe { token: Token, delete_data: bool },
    /// Store and distribute a value.
    Publish {
        name: String,
        value: Payload,
        on_validate: Option<ValidateCallback>,
    },
    /// Issue (or join) a one-shot request.
    Request {
        name: String,
        on_response: DataCallback,
        on_error: Option<ErrorCallback>,
        payload: Option<Payload>,
        reply: oneshot::Sender<Token>,
    },
    /// Replace the filter of a live subscription.
    ChangeFilter { name: String, filter: Filter },
    /// Drop a topic and delete its server-side resource.
    Delete { name: String },
    /// Report a client-originated error.
    RaiseError { name: String, error: ErrorMsg },
    /// Switch the app namespace for subsequent resolutions.
    SetCurrentApp { name: String },
    /// Read the cached value of a topic.
    GetData {
        name: String,
        reply: oneshot::Sender<Option<Payload>>,
    },
    /// Read the stored error of a topic.
    GetError {
        name: String,
        reply: oneshot::Sender<Option<ErrorMsg>>,
    },
    /// Inbound frame from the transport.
    Frame(Frame),
    /// Connection notice from the transport.
    Notice(ErrorMsg),
    /// A request's timeout fired.
    ExpireRequest { topic: String, request_id: Uuid },
    /// Stop the broker task.
    Shutdown,
}

/// A pending one-shot request: callbacks waiting for the single response.
struct RequestEntry {
    /// Distinguishes this request from a later one on the same topic, so a
    /// stale timeout cannot cancel its successor.
    id: Uuid,
    callbacks: Vec<(CallbackId, DataCallback)>,
    error_callbacks: Vec<(CallbackId, ErrorCallback)>,
}

impl RequestEntry {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    fn add_callbacks(
        &mut self,
        id: CallbackId,
        on_response: DataCallback,
        on_error: Option<ErrorCallback>,
    ) {
        self.callbacks.push((id, on_response));
        if let Some(on_error) = on_error {
            self.error_callbacks.push((id, on_error));
        }
    }

    fn remove_callbacks(&mut self, id: CallbackId) {
        self.callbacks.retain(|(callback_id, _)| *callback_id != id);
        self.error_callbacks
            .retain(|(callback_id, _)| *callback_id != id);
    }

    fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.error_callbacks.is_empty()
    }

    fn callback_ids(&self) -> Vec<CallbackId> {
        let mut ids: Vec<CallbackId> = self
            .callbacks
            .iter()
            .map(|(id, _)| *id)
            .chain(self.error_callbacks.iter().map(|(id, _)| *id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// The registry: single-owner topic state plus the deferred delivery queue.
pub struct Broker {
    resolver: TopicResolver,
    topics: HashMap<String, TopicEntry>,
    requests: HashMap<String, RequestEntry>,
    /// Maps a token's callback id to the resolved entry it registered on.
    token_index: HashMap<CallbackId, String>,
    deliveries: DeliveryQueue,
    sink: Box<dyn FrameSink>,
    /// Requests whose expiry timers still need scheduling by the task loop.
    expirations: Vec<(String, Uuid)>,
}

impl Broker {
    /// Creates an empty registry sending frames into the given sink.
    pub fn new(app_name: &str, sink: Box<dyn FrameSink>) -> Self {
        Self {
            resolver: TopicResolver::new(app_name),
            topics: HashMap::new(),
            requests: HashMap::new(),
            token_index: HashMap::new(),
            deliveries: DeliveryQueue::new(),
            sink,
            expirations: Vec::new(),
        }
    }

    /// Resolves a topic name against the registry's cached values.
    fn resolve(&self, name: &str) -> String {
        let topics = &self.topics;
        self.resolver.resolve(name, |topic| {
            topics
                .get(topic)
                .and_then(|entry| entry.data.as_ref())
                .map(|data| data.as_substitution())
        })
    }

    /// Splits a topic name into (resolved parent, field, entry key).
    fn entry_key(&self, name: &str) -> (String, String, String) {
        let parent = self.resolve(name);
        let field = TopicResolver::field_name(name).to_string();
        let key = if field.is_empty() {
            parent.clone()
        } else {
            format!("{parent}#{field}")
        };
        (parent, field, key)
    }

    fn new_token(&self, name: &str) -> Token {
        Token {
            app_name: self.resolver.app_name().to_string(),
            topic: name.to_string(),
            id: Uuid::new_v4(),
        }
    }

    /// Removes an entry and forgets the tokens registered on it.
    fn drop_entry(&mut self, key: &str) {
        if let Some(entry) = self.topics.remove(key) {
            for id in entry.callback_ids() {
                self.token_index.remove(&id);
            }
        }
    }

    /// Registers a subscription and returns its token.
    ///
    /// A new non-local entry causes a `subscribe` frame; an existing entry
    /// with resident data serves the new subscriber from the cache, unless a
    /// fresh filter forces a fetch. A field subscription whose parent is
    /// already cached is served from the parent's value.
    pub fn subscribe(
        &mut self,
        name: &str,
        on_data: DataCallback,
        on_error: Option<ErrorCallback>,
        filter: Option<Filter>,
    ) -> Token {
        let (parent, field, key) = self.entry_key(name);
        let token = self.new_token(name);
        self.token_index.insert(token.id, key.clone());

        if self.topics.contains_key(&key) {
            if let Some(entry) = self.topics.get_mut(&key) {
                entry.add_callbacks(token.id, Some(on_data), on_error);
                match filter {
                    None => {
                        if entry.data.is_some() {
                            entry.deliver(token.id, &mut self.deliveries);
                        }
                    }
                    Some(filter) => {
                        entry.filter = Some(filter.clone());
                        if !is_local(&key) {
                            self.sink.send(Frame::Subscribe {
                                topic: key.clone(),
                                filter: Some(filter),
                            });
                        }
                    }
                }
            }
            return token;
        }

        let mut entry = TopicEntry::new(key.clone());
        entry.filter = filter.clone();
        entry.add_callbacks(token.id, Some(on_data), on_error);

        let mut resident = is_local(&key);
        if !field.is_empty() {
            if let Some(parent_entry) = self.topics.get(&parent) {
                if parent_entry
                    .data
                    .as_ref()
                    .and_then(|data| data.field(&field))
                    .is_some()
                {
                    parent_entry.deliver_field(&field, &key, token.id, &mut self.deliveries);
                    resident = true;
                }
            }
        }
        if !resident {
            self.sink.send(Frame::Subscribe {
                topic: key.clone(),
                filter,
            });
        }
        self.topics.insert(key, entry);
        token
    }

    /// Removes exactly the callbacks identified by the token.
    ///
    /// Unsubscribing the last subscriber of a non-local topic sends one
    /// `unsubscribe` frame and drops the entry. Local entries persist
    /// without subscribers unless `delete_data` is requested. Unknown tokens
    /// are a no-op.
    pub fn unsubscribe(&mut self, token: &Token, delete_data: bool) {
        let Some(key) = self.token_index.remove(&token.id) else {
            return;
        };

        if let Some(entry) = self.topics.get_mut(&key) {
            entry.remove_callbacks(token.id);
            if !entry.has_subscribers() {
                if !is_local(&key) {
                    self.sink.send(Frame::Unsubscribe { topic: key.clone() });
                    self.drop_entry(&key);
                } else if delete_data {
                    self.drop_entry(&key);
                }
            }
            return;
        }

        if let Some(request) = self.requests.get_mut(&key) {
            request.remove_callbacks(token.id);
            if request.is_empty() {
                self.requests.remove(&key);
            }
        }
    }

    /// Stores a value and distributes it.
    ///
    /// Local topics notify their subscribers (deferred); non-local topics
    /// produce a `publish` frame and are notified by the server's echo.
    /// Every publish except to the reserved topics also fans out to
    /// [`TOPIC_ANY`] when that topic currently has subscribers.
    pub fn publish(&mut self, name: &str, value: Payload, on_validate: Option<ValidateCallback>) {
        let (parent, field, _) = self.entry_key(name);
        if !field.is_empty() {
            self.publish_field(&parent, &field, value);
            return;
        }

        let entry = self
            .topics
            .entry(parent.clone())
            .or_insert_with(|| TopicEntry::new(parent.clone()));

        // The hook slot is last-writer-wins: a form field re-registers its
        // validator on every render.
        if let Some(validator) = on_validate {
            entry.validate = Some(validator);
        }
        if let Some(validator) = entry.validate.as_mut() {
            if let Err(error) = run_validator(validator, &parent, &value) {
                entry.error = Some(error);
                entry.call_error_callbacks(&mut self.deliveries);
                return;
            }
        }

        entry.data = Some(value.clone());
        entry.error = None;
        if is_local(&parent) {
            entry.call_callbacks(&mut self.deliveries);
        } else {
            self.sink.send(Frame::Publish {
                topic: parent.clone(),
                content: value.to_wire(),
            });
        }
        self.fan_out_any(&parent, &value);
    }

    /// Field-level side channel: updates the parent's cached value at one
    /// key without notifying parent-topic subscribers. Only subscribers of
    /// the exact field-qualified name see the change.
    fn publish_field(&mut self, parent: &str, field: &str, value: Payload) {
        let key = format!("{parent}#{field}");
        let wire_value = value.to_wire();

        self.topics
            .entry(parent.to_string())
            .or_insert_with(|| TopicEntry::new(parent))
            .set_field_value(field, wire_value.clone());

        let entry = self
            .topics
            .entry(key.clone())
            .or_insert_with(|| TopicEntry::new(key.clone()));
        entry.data = Some(value.clone());
        if is_local(parent) {
            entry.call_callbacks(&mut self.deliveries);
        } else {
            self.sink.send(Frame::Publish {
                topic: key.clone(),
                content: wire_value,
            });
        }
        self.fan_out_any(&key, &value);
    }

    /// Issues a one-shot request, or joins the in-flight one.
    ///
    /// Simultaneous callers on the same resolved topic share a single
    /// outbound frame and the single response; the pending entry and every
    /// callback are discarded the instant the response arrives.
    pub fn send_request(
        &mut self,
        name: &str,
        on_response: DataCallback,
        on_error: Option<ErrorCallback>,
        payload: Option<Payload>,
    ) -> Token {
        let key = self.resolve(name);
        let token = self.new_token(name);

        // Local topics have no server side; answer from the cache.
        if is_local(&key) {
            match self.topics.get(&key).and_then(|entry| entry.data.clone()) {
                Some(data) => self.deliveries.push_owned_data(key, on_response, data),
                None => {
                    if let Some(on_error) = on_error {
                        self.deliveries.push_owned_error(
                            key.clone(),
                            on_error,
                            ErrorMsg::error(
                                "no data",
                                format!("local topic {key} has no cached value"),
                            ),
                        );
                    }
                }
            }
            return token;
        }

        self.token_index.insert(token.id, key.clone());
        if let Some(request) = self.requests.get_mut(&key) {
            request.add_callbacks(token.id, on_response, on_error);
            return token;
        }

        let mut request = RequestEntry::new();
        request.add_callbacks(token.id, on_response, on_error);
        self.expirations.push((key.clone(), request.id));
        self.requests.insert(key.clone(), request);
        self.sink.send(Frame::Request {
            topic: key,
            content: payload.map(|p| p.to_wire()).unwrap_or(Value::Null),
        });
        token
    }

    /// Delivers the single response of a pending request and discards the
    /// entry. A response with no pending request is dropped.
    pub fn handle_response(&mut self, topic: &str, content: Value) {
        let Some(request) = self.requests.remove(topic) else {
            tracing::debug!(topic, "response without a pending request, dropped");
            return;
        };
        for id in request.callback_ids() {
            self.token_index.remove(&id);
        }

        match Payload::from_wire(topic, content) {
            Ok(payload) => {
                for (_, callback) in request.callbacks {
                    self.deliveries
                        .push_owned_data(topic.to_string(), callback, payload.clone());
                }
            }
            Err(e) => {
                let error = ErrorMsg::error("malformed response", e.to_string());
                for (_, callback) in request.error_callbacks {
                    self.deliveries
                        .push_owned_error(topic.to_string(), callback, error.clone());
                }
            }
        }
    }

    /// Stores an inbound value and notifies subscribers of the topic, plus
    /// the wildcard audience.
    pub fn handle_publish(&mut self, topic: &str, content: Value) {
        let payload = match Payload::from_wire(topic, content) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, error = %e, "discarding malformed inbound publish");
                return;
            }
        };

        let field = TopicResolver::field_name(topic).to_string();
        if !field.is_empty() {
            let parent = TopicResolver::strip_field(topic).to_string();
            let wire_value = payload.to_wire();
            self.topics
                .entry(parent.clone())
                .or_insert_with(|| TopicEntry::new(parent))
                .set_field_value(&field, wire_value);
        }

        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry::new(topic));
        entry.data = Some(payload.clone());
        entry.error = None;
        entry.call_callbacks(&mut self.deliveries);
        self.fan_out_any(topic, &payload);
    }

    /// Reports a client-originated error: stored on the entry, delivered to
    /// its error callbacks, and forwarded to the server for logging.
    pub fn raise_error(&mut self, name: &str, error: ErrorMsg) {
        let (_, _, key) = self.entry_key(name);
        let entry = self
            .topics
            .entry(key.clone())
            .or_insert_with(|| TopicEntry::new(key.clone()));
        entry.error = Some(error.clone());
        entry.call_error_callbacks(&mut self.deliveries);
        self.sink.send(Frame::Error {
            topic: key,
            title: error.title,
            detail: error.detail,
        });
    }

    /// Handles an inbound error frame: completes a pending request on the
    /// topic, stores the error, notifies the topic's error callbacks, and
    /// broadcasts onto [`TOPIC_ERRORS`] for generic observers.
    pub fn handle_server_error(&mut self, topic: &str, error: ErrorMsg) {
        if let Some(request) = self.requests.remove(topic) {
            for id in request.callback_ids() {
                self.token_index.remove(&id);
            }
            for (_, callback) in request.error_callbacks {
                self.deliveries
                    .push_owned_error(topic.to_string(), callback, error.clone());
            }
        }

        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry::new(topic));
        entry.error = Some(error.clone());
        entry.call_error_callbacks(&mut self.deliveries);
        self.broadcast_error(topic, &error);
    }

    /// Publishes a connection notice onto [`TOPIC_CONNECTION`] and mirrors
    /// it to the error broadcast.
    pub fn handle_notice(&mut self, notice: ErrorMsg) {
        let payload = Payload::Json(serde_json::to_value(&notice).unwrap_or(Value::Null));
        let entry = self
            .topics
            .entry(TOPIC_CONNECTION.to_string())
            .or_insert_with(|| TopicEntry::new(TOPIC_CONNECTION));
        entry.data = Some(payload);
        entry.call_callbacks(&mut self.deliveries);
        self.broadcast_error(TOPIC_CONNECTION, &notice);
    }

    /// Delivers `{topic, error}` to subscribers of the reserved error topic,
    /// if there are any.
    fn broadcast_error(&mut self, topic: &str, error: &ErrorMsg) {
        let Some(errors_entry) = self.topics.get(TOPIC_ERRORS) else {
            return;
        };
        if !errors_entry.has_subscribers() {
            return;
        }
        let envelope = Payload::Json(json!({
            "topic": topic,
            "error": serde_json::to_value(error).unwrap_or(Value::Null),
        }));
        for id in errors_entry.callback_ids() {
            self.deliveries
                .push_data(TOPIC_ERRORS.to_string(), id, envelope.clone());
        }
    }

    /// Delivers `{topic, data}` to subscribers of the wildcard topic, if and
    /// only if it currently has any. The reserved topics themselves are
    /// excluded from the fan-out.
    fn fan_out_any(&mut self, topic: &str, value: &Payload) {
        if topic == TOPIC_ANY || topic == TOPIC_ERRORS || topic == TOPIC_CONNECTION {
            return;
        }
        let Some(any_entry) = self.topics.get(TOPIC_ANY) else {
            return;
        };
        if !any_entry.has_subscribers() {
            return;
        }
        let envelope = Payload::Json(json!({
            "topic": topic,
            "data": value.to_wire(),
        }));
        for id in any_entry.callback_ids() {
            self.deliveries
                .push_data(TOPIC_ANY.to_string(), id, envelope.clone());
        }
    }

    /// Replaces the filter of a live subscription and re-issues the
    /// `subscribe` frame; used for table paging without tearing the
    /// subscription down.
    pub fn change_filter(&mut self, name: &str, filter: Filter) {
        let (_, _, key) = self.entry_key(name);
        let Some(entry) = self.topics.get_mut(&key) else {
            tracing::warn!(topic = %key, "change_filter on unknown topic ignored");
            return;
        };
        entry.filter = Some(filter.clone());
        if !is_local(&key) {
            self.sink.send(Frame::Subscribe {
                topic: key,
                filter: Some(filter),
            });
        }
    }

    /// Drops a topic entry; non-local topics also instruct the server to
    /// remove the backing resource.
    pub fn delete(&mut self, name: &str) {
        let (_, _, key) = self.entry_key(name);
        self.drop_entry(&key);
        if !is_local(&key) {
            self.sink.send(Frame::Delete { topic: key });
        }
    }

    /// Switches the app namespace for subsequent resolutions.
    pub fn set_current_app(&mut self, name: &str) {
        self.resolver.set_app_name(name);
    }

    /// Reads the cached value of a topic; field-qualified names fall back to
    /// the parent's cached object.
    pub fn get_data(&self, name: &str) -> Option<Payload> {
        let (parent, field, key) = self.entry_key(name);
        if let Some(data) = self.topics.get(&key).and_then(|entry| entry.data.clone()) {
            return Some(data);
        }
        if !field.is_empty() {
            if let Some(value) = self
                .topics
                .get(&parent)
                .and_then(|entry| entry.data.as_ref())
                .and_then(|data| data.field(&field))
            {
                return Some(Payload::Json(value.clone()));
            }
        }
        None
    }

    /// Reads the stored error of a topic.
    pub fn get_error(&self, name: &str) -> Option<ErrorMsg> {
        let (_, _, key) = self.entry_key(name);
        self.topics.get(&key).and_then(|entry| entry.error.clone())
    }

    /// Abandons a request whose timeout fired. A stale timer (the request
    /// already completed, possibly replaced by a newer one) is a no-op.
    pub fn expire_request(&mut self, topic: &str, request_id: Uuid) {
        match self.requests.get(topic) {
            Some(request) if request.id == request_id => {}
            _ => return,
        }
        let Some(request) = self.requests.remove(topic) else {
            return;
        };
        tracing::warn!(topic, "request timed out, discarding pending callbacks");
        for id in request.callback_ids() {
            self.token_index.remove(&id);
        }
        let error = ErrorMsg::error("request timed out", format!("no response for {topic}"));
        for (_, callback) in request.error_callbacks {
            self.deliveries
                .push_owned_error(topic.to_string(), callback, error.clone());
        }
    }

    /// Takes the requests whose expiry timers still need scheduling.
    pub fn take_expirations(&mut self) -> Vec<(String, Uuid)> {
        std::mem::take(&mut self.expirations)
    }

    /// Processes one command.
    pub fn dispatch(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                name,
                on_data,
                on_error,
                filter,
                reply,
            } => {
                let token = self.subscribe(&name, on_data, on_error, filter);
                let _ = reply.send(token);
            }
            Command::Unsubscribe { token, delete_data } => self.unsubscribe(&token, delete_data),
            Command::Publish {
                name,
                value,
                on_validate,
            } => self.publish(&name, value, on_validate),
            Command::Request {
                name,
                on_response,
                on_error,
                payload,
                reply,
            } => {
                let token = self.send_request(&name, on_response, on_error, payload);
                let _ = reply.send(token);
            }
            Command::ChangeFilter { name, filter } => self.change_filter(&name, filter),
            Command::Delete { name } => self.delete(&name),
            Command::RaiseError { name, error } => self.raise_error(&name, error),
            Command::SetCurrentApp { name } => self.set_current_app(&name),
            Command::GetData { name, reply } => {
                let _ = reply.send(self.get_data(&name));
            }
            Command::GetError { name, reply } => {
                let _ = reply.send(self.get_error(&name));
            }
            Command::Frame(frame) => match frame {
                Frame::Publish { topic, content } => self.handle_publish(&topic, content),
                Frame::Response { topic, content } => self.handle_response(&topic, content),
                Frame::Error {
                    topic,
                    title,
                    detail,
                } => self.handle_server_error(&topic, ErrorMsg::error(title, detail)),
                other => {
                    tracing::debug!(topic = other.topic(), "ignoring unexpected inbound frame")
                }
            },
            Command::Notice(notice) => self.handle_notice(notice),
            Command::ExpireRequest { topic, request_id } => {
                self.expire_request(&topic, request_id)
            }
            // Shutdown is intercepted by the task loop.
            Command::Shutdown => {}
        }
    }

    /// Drains the deferred delivery queue, invoking callbacks in the order
    /// they were scheduled. Panicking callbacks are isolated.
    pub fn flush_deliveries(&mut self) {
        while let Some(delivery) = self.deliveries.pop() {
            match delivery {
                Delivery::Data {
                    topic,
                    target,
                    payload,
                } => {
                    if let Some(callback) = self
                        .topics
                        .get_mut(&topic)
                        .and_then(|entry| entry.data_callback_mut(target))
                    {
                        invoke_data_callback(callback, &topic, &payload);
                    }
                }
                Delivery::Error {
                    topic,
                    target,
                    error,
                } => {
                    if let Some(callback) = self
                        .topics
                        .get_mut(&topic)
                        .and_then(|entry| entry.error_callback_mut(target))
                    {
                        invoke_error_callback(callback, &topic, &error);
                    }
                }
                Delivery::OwnedData {
                    topic,
                    mut callback,
                    payload,
                } => invoke_data_callback(&mut callback, &topic, &payload),
                Delivery::OwnedError {
                    topic,
                    mut callback,
                    error,
                } => invoke_error_callback(&mut callback, &topic, &error),
            }
        }
    }
}

/// Runs a publish-validation hook, isolating panics. A panicking validator
/// counts as accepting the value.
fn run_validator(
    validator: &mut ValidateCallback,
    topic: &str,
    payload: &Payload,
) -> std::result::Result<(), ErrorMsg> {
    match catch_unwind(AssertUnwindSafe(|| validator(topic, payload))) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(topic, "validation callback panicked; value accepted");
            Ok(())
        }
    }
}

/// Drives a broker over its command channel.
///
/// Commands are processed one at a time; the delivery queue is drained only
/// after each command completes, and request expiry timers are scheduled
/// between the two.
pub async fn run(
    mut broker: Broker,
    mut commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    request_timeout: Duration,
) {
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::Shutdown) {
            break;
        }
        broker.dispatch(command);
        let expirations = broker.take_expirations();
        if !request_timeout.is_zero() {
            for (topic, request_id) in expirations {
                let command_tx = command_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(request_timeout).await;
                    let _ = command_tx.send(Command::ExpireRequest { topic, request_id });
                });
            }
        }
        broker.flush_deliveries();
    }
    tracing::debug!("broker task stopped");
}

/// Forwards transport events into broker commands.
pub async fn forward_transport_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedSender<Command>,
) {
    while let Some(event) = events.recv().await {
        let command = match event {
            TransportEvent::Frame(frame) => Command::Frame(frame),
            TransportEvent::Notice(notice) => Command::Notice(notice),
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "transport connection state changed");
                continue;
            }
        };
        if commands.send(command).is_err() {
            break;
        }
    }
}

/// Cloneable consumer handle over the broker task.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    auth: Arc<TokioMutex<SessionAuth>>,
}

impl Hub {
    /// Connects to the configured server and spawns the broker, transport,
    /// and event-forwarding tasks. Must be called within a tokio runtime.
    pub fn connect(config: Config) -> Result<Hub> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let auth = Arc::new(TokioMutex::new(SessionAuth::new(
            &config.connection.app_name,
        )));

        let transport = TransportClient::new(
            TransportConfig::from_config(&config),
            event_tx,
            auth.clone(),
        );
        let sink = transport.handle();
        let broker = Broker::new(&config.connection.app_name, Box::new(sink));

        tokio::spawn(transport.run());
        tokio::spawn(forward_transport_events(event_rx, command_tx.clone()));
        tokio::spawn(run(
            broker,
            command_rx,
            command_tx.clone(),
            config.requests.timeout(),
        ));

        Ok(Hub {
            commands: command_tx,
            auth,
        })
    }

    /// Builds a hub over a custom frame sink without a live transport, for
    /// tests and embedding.
    pub fn with_frame_sink(
        app_name: &str,
        request_timeout: Duration,
        sink: Box<dyn FrameSink>,
    ) -> Hub {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let auth = Arc::new(TokioMutex::new(SessionAuth::new(app_name)));
        let broker = Broker::new(app_name, sink);
        tokio::spawn(run(
            broker,
            command_rx,
            command_tx.clone(),
            request_timeout,
        ));
        Hub {
            commands: command_tx,
            auth,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| HubError::BrokerClosed)
    }

    /// Registers a subscription; see [`Broker::subscribe`].
    pub async fn subscribe(
        &self,
        topic: &str,
        on_data: DataCallback,
        on_error: Option<ErrorCallback>,
        filter: Option<Filter>,
    ) -> Result<Token> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Subscribe {
            name: topic.to_string(),
            on_data,
            on_error,
            filter,
            reply,
        })?;
        response.await.map_err(|_| HubError::BrokerClosed)
    }

    /// Removes the callbacks registered under the token.
    pub fn unsubscribe(&self, token: Token, delete_data: bool) -> Result<()> {
        self.send(Command::Unsubscribe { token, delete_data })
    }

    /// Stores and distributes a value; see [`Broker::publish`].
    pub fn publish(
        &self,
        topic: &str,
        value: Payload,
        on_validate: Option<ValidateCallback>,
    ) -> Result<()> {
        self.send(Command::Publish {
            name: topic.to_string(),
            value,
            on_validate,
        })
    }

    /// Issues (or joins) a one-shot request; see [`Broker::send_request`].
    pub async fn send_request(
        &self,
        topic: &str,
        on_response: DataCallback,
        on_error: Option<ErrorCallback>,
        payload: Option<Payload>,
    ) -> Result<Token> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Request {
            name: topic.to_string(),
            on_response,
            on_error,
            payload,
            reply,
        })?;
        response.await.map_err(|_| HubError::BrokerClosed)
    }

    /// Replaces the filter of a live subscription.
    pub fn change_filter(&self, topic: &str, filter: Filter) -> Result<()> {
        self.send(Command::ChangeFilter {
            name: topic.to_string(),
            filter,
        })
    }

    /// Drops a topic and deletes its server-side resource.
    pub fn delete(&self, topic: &str) -> Result<()> {
        self.send(Command::Delete {
            name: topic.to_string(),
        })
    }

    /// Reports a client-originated error.
    pub fn raise_error(&self, topic: &str, error: ErrorMsg) -> Result<()> {
        self.send(Command::RaiseError {
            name: topic.to_string(),
            error,
        })
    }

    /// Switches the app namespace used for resolution and authentication.
    pub async fn set_current_app(&self, name: &str) -> Result<()> {
        self.auth.lock().await.app_name = name.to_string();
        self.send(Command::SetCurrentApp {
            name: name.to_string(),
        })
    }

    /// Reads the cached value of a topic.
    pub async fn get_current_data(&self, topic: &str) -> Result<Option<Payload>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetData {
            name: topic.to_string(),
            reply,
        })?;
        response.await.map_err(|_| HubError::BrokerClosed)
    }

    /// Reads the stored error of a topic.
    pub async fn get_current_error(&self, topic: &str) -> Result<Option<ErrorMsg>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetError {
            name: topic.to_string(),
            reply,
        })?;
        response.await.map_err(|_| HubError::BrokerClosed)
    }

    /// Stops the broker task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Performs the login handshake: key exchange, then submission of the
    /// encrypted password digest. On success the credentials are cached so
    /// the transport can re-authenticate transparently on reconnect.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let (app_name, client_public) = {
            let mut auth = self.auth.lock().await;
            (auth.app_name.clone(), auth.crypto.generate_client_keys())
        };

        let response = self
            .request_json(
                &login_topic(&app_name),
                json!({
                    "username": username,
                    "public_key": client_public,
                }),
            )
            .await?;

        let server_public = response
            .get("public_key")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::Auth("login response missing public_key".to_string()))?;
        let session_id = response
            .get("session")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::Auth("login response missing session".to_string()))?
            .to_string();

        let secret = {
            let mut auth = self.auth.lock().await;
            auth.crypto.generate_shared_secret(server_public)?;
            let password_digest = hex::encode(Sha256::digest(password.as_bytes()));
            auth.crypto.encrypt(&password_digest)?
        };

        self.request_json(
            &authenticate_topic(&app_name),
            json!({
                "username": username,
                "session": session_id,
                "secret": secret,
            }),
        )
        .await?;

        self.auth.lock().await.credentials = Some(Credentials {
            username: username.to_string(),
            app_name,
        });
        tracing::info!(username, "session established");
        Ok(())
    }

    /// Clears cached credentials and the derived session key.
    pub async fn logout(&self) {
        self.auth.lock().await.reset();
        tracing::info!("session cleared");
    }

    /// One-shot request returning the raw response value; server errors
    /// complete the future with an authentication error.
    async fn request_json(&self, topic: &str, payload: Value) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Value>>();
        let slot = Arc::new(StdMutex::new(Some(reply_tx)));

        let on_response: DataCallback = {
            let slot = slot.clone();
            Box::new(move |_topic, payload| {
                if let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                    let _ = tx.send(Ok(payload.to_wire()));
                }
            })
        };
        let on_error: ErrorCallback = {
            let slot = slot.clone();
            Box::new(move |_topic, error| {
                if let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                    let _ = tx.send(Err(HubError::Auth(format!(
                        "{}: {}",
                        error.title, error.detail
                    ))));
                }
            })
        };

        self.send_request(topic, on_response, Some(on_error), Some(Payload::Json(payload)))
            .await?;
        reply_rx.await.map_err(|_| HubError::BrokerClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<StdMutex<Vec<Frame>>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn test_broker() -> (Broker, RecordingSink) {
        let sink = RecordingSink::default();
        (Broker::new("studio", Box::new(sink.clone())), sink)
    }

    fn log_callback(log: Arc<StdMutex<Vec<String>>>, label: &str) -> DataCallback {
        let label = label.to_string();
        Box::new(move |topic, payload| {
            log.lock()
                .unwrap()
                .push(format!("{label}:{topic}={}", payload.as_substitution()));
        })
    }

    fn title_collector(log: Arc<StdMutex<Vec<String>>>) -> ErrorCallback {
        Box::new(move |_topic, error| {
            log.lock().unwrap().push(error.title.clone());
        })
    }

    fn noop_data() -> DataCallback {
        Box::new(|_, _| {})
    }

    #[test]
    fn test_cached_local_topic_served_without_round_trip() {
        let (mut broker, sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker.publish("selection", Payload::Json(json!("page-1")), None);
        broker.flush_deliveries();

        broker.subscribe("selection", log_callback(log.clone(), "a"), None, None);
        broker.subscribe("selection", log_callback(log.clone(), "b"), None, None);
        // Deliveries are deferred: nothing has run before the drain.
        assert!(log.lock().unwrap().is_empty());
        broker.flush_deliveries();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["a:app:selection=page-1", "b:app:selection=page-1"]
        );
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_remote_subscription_frame_accounting() {
        let (mut broker, sink) = test_broker();

        let first = broker.subscribe("/Pages/index.json", noop_data(), None, None);
        let second = broker.subscribe("/Pages/index.json", noop_data(), None, None);
        broker.flush_deliveries();

        // Only the first subscriber causes a frame.
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            Frame::Subscribe { topic, .. } if topic == "json:/studio/Pages/index.json"
        ));

        // Unsubscribing a non-last subscriber sends nothing.
        broker.unsubscribe(&first, false);
        assert_eq!(sink.frame_count(), 1);

        // The last subscriber sends exactly one unsubscribe frame.
        broker.unsubscribe(&second, false);
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[1],
            Frame::Unsubscribe { topic } if topic == "json:/studio/Pages/index.json"
        ));

        // A dead token is a no-op.
        broker.unsubscribe(&second, false);
        assert_eq!(sink.frame_count(), 2);
    }

    #[test]
    fn test_field_publish_skips_parent_subscribers() {
        let (mut broker, sink) = test_broker();
        let parent_log = Arc::new(StdMutex::new(Vec::new()));
        let field_log = Arc::new(StdMutex::new(Vec::new()));

        broker.subscribe("formData", log_callback(parent_log.clone(), "parent"), None, None);
        broker.subscribe(
            "formData#username",
            log_callback(field_log.clone(), "field"),
            None,
            None,
        );
        broker.publish("formData#username", Payload::Json(json!("ada")), None);
        broker.flush_deliveries();

        assert!(parent_log.lock().unwrap().is_empty());
        assert_eq!(field_log.lock().unwrap().len(), 1);
        assert_eq!(
            broker.get_data("formData"),
            Some(Payload::Json(json!({"username": "ada"})))
        );
        assert_eq!(
            broker.get_data("formData#username"),
            Some(Payload::Json(json!("ada")))
        );
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_field_subscription_served_from_cached_parent() {
        let (mut broker, sink) = test_broker();
        // Seed the parent as an inbound server publish would.
        broker.handle_publish("json:/studio/Pages/home.json", json!({"title": "Home"}));
        broker.flush_deliveries();

        let log = Arc::new(StdMutex::new(Vec::new()));
        broker.subscribe(
            "json:/studio/Pages/home.json#title",
            log_callback(log.clone(), "t"),
            None,
            None,
        );
        broker.flush_deliveries();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["t:json:/studio/Pages/home.json#title=Home"]
        );
        // Served from the parent cache: no round trip.
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_wildcard_fan_out_requires_subscribers() {
        let (mut broker, _sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));

        // No wildcard subscribers yet: the fan-out is skipped entirely.
        broker.publish("selection", Payload::Json(json!(1)), None);
        broker.flush_deliveries();
        assert!(log.lock().unwrap().is_empty());

        broker.subscribe(TOPIC_ANY, log_callback(log.clone(), "any"), None, None);
        broker.publish("selection", Payload::Json(json!(2)), None);
        broker.flush_deliveries();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("app:selection"));

        // Reserved topics never fan out to themselves.
        broker.publish(TOPIC_ERRORS, Payload::Json(json!("x")), None);
        broker.flush_deliveries();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_request_coalescing_and_single_delivery() {
        let (mut broker, sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker.send_request("/content/stats.sql", log_callback(log.clone(), "a"), None, None);
        broker.send_request("/content/stats.sql", log_callback(log.clone(), "b"), None, None);
        broker.flush_deliveries();
        // Two in-flight callers share one outbound frame.
        assert_eq!(sink.frame_count(), 1);

        broker.handle_response("query:/studio/content/stats.sql", json!("42"));
        broker.flush_deliveries();
        assert_eq!(log.lock().unwrap().len(), 2);

        // The entry was discarded: a third call sends a fresh frame...
        broker.send_request("/content/stats.sql", log_callback(log.clone(), "c"), None, None);
        broker.flush_deliveries();
        assert_eq!(sink.frame_count(), 2);

        // ...and its response reaches only the new caller.
        broker.handle_response("query:/studio/content/stats.sql", json!("43"));
        broker.flush_deliveries();
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_request_timeout_discards_entry() {
        let (mut broker, sink) = test_broker();
        let errors = Arc::new(StdMutex::new(Vec::new()));

        broker.send_request(
            "/content/slow.sql",
            noop_data(),
            Some(title_collector(errors.clone())),
            None,
        );
        let expirations = broker.take_expirations();
        assert_eq!(expirations.len(), 1);
        let (topic, request_id) = expirations[0].clone();

        // A stale id does nothing.
        broker.expire_request(&topic, Uuid::new_v4());
        broker.flush_deliveries();
        assert!(errors.lock().unwrap().is_empty());

        broker.expire_request(&topic, request_id);
        broker.flush_deliveries();
        assert_eq!(errors.lock().unwrap().as_slice(), ["request timed out"]);

        // The entry is gone; a late response is dropped silently.
        broker.handle_response(&topic, json!("late"));
        broker.flush_deliveries();
        assert_eq!(sink.frame_count(), 1);
    }

    #[test]
    fn test_server_error_reaches_topic_and_broadcast() {
        let (mut broker, _sink) = test_broker();
        let topic_errors = Arc::new(StdMutex::new(Vec::new()));
        let banner = Arc::new(StdMutex::new(Vec::new()));

        broker.subscribe(
            "/Pages/index.json",
            noop_data(),
            Some(title_collector(topic_errors.clone())),
            None,
        );
        broker.subscribe(TOPIC_ERRORS, log_callback(banner.clone(), "banner"), None, None);
        broker.handle_server_error(
            "json:/studio/Pages/index.json",
            ErrorMsg::error("not found", "missing page"),
        );
        broker.flush_deliveries();

        assert_eq!(topic_errors.lock().unwrap().as_slice(), ["not found"]);
        assert_eq!(banner.lock().unwrap().len(), 1);
        assert_eq!(
            broker.get_error("/Pages/index.json").map(|e| e.title),
            Some("not found".to_string())
        );
    }

    #[test]
    fn test_server_error_completes_pending_request() {
        let (mut broker, _sink) = test_broker();
        let errors = Arc::new(StdMutex::new(Vec::new()));

        broker.send_request(
            "/content/stats.sql",
            noop_data(),
            Some(title_collector(errors.clone())),
            None,
        );
        broker.handle_server_error(
            "query:/studio/content/stats.sql",
            ErrorMsg::error("denied", "not allowed"),
        );
        broker.flush_deliveries();
        assert_eq!(errors.lock().unwrap().as_slice(), ["denied"]);

        // The request is gone; its response would now be dropped.
        broker.handle_response("query:/studio/content/stats.sql", json!("42"));
        broker.flush_deliveries();
    }

    #[test]
    fn test_raise_error_forwards_to_server() {
        let (mut broker, sink) = test_broker();
        broker.raise_error("/Pages/index.json", ErrorMsg::error("validation", "bad title"));
        broker.flush_deliveries();

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            Frame::Error { topic, title, .. }
                if topic == "json:/studio/Pages/index.json" && title == "validation"
        ));
    }

    #[test]
    fn test_change_filter_reissues_subscribe() {
        let (mut broker, sink) = test_broker();
        broker.subscribe(
            "/content/pages.sql",
            noop_data(),
            None,
            Some(Filter::default()),
        );

        let filter = Filter {
            offset: 20,
            ..Filter::default()
        };
        broker.change_filter("/content/pages.sql", filter.clone());

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[1],
            Frame::Subscribe { filter: Some(f), .. } if f.offset == 20
        ));

        // Unknown topics are ignored.
        broker.change_filter("/content/unknown.sql", filter);
        assert_eq!(sink.frame_count(), 2);
    }

    #[test]
    fn test_delete_drops_entry_and_notifies_server() {
        let (mut broker, sink) = test_broker();
        broker.handle_publish("file:/studio/notes.txt", json!("body"));
        broker.flush_deliveries();
        assert!(broker.get_data("file:/studio/notes.txt").is_some());

        broker.delete("file:/studio/notes.txt");
        assert!(broker.get_data("file:/studio/notes.txt").is_none());
        let frames = sink.frames();
        assert!(matches!(
            frames.last(),
            Some(Frame::Delete { topic }) if topic == "file:/studio/notes.txt"
        ));
    }

    #[test]
    fn test_local_entries_persist_without_subscribers() {
        let (mut broker, _sink) = test_broker();
        let token = broker.subscribe("selection", noop_data(), None, None);
        broker.publish("selection", Payload::Json(json!("page-1")), None);
        broker.flush_deliveries();

        broker.unsubscribe(&token, false);
        // Late readers still see the value.
        assert_eq!(
            broker.get_data("selection"),
            Some(Payload::Json(json!("page-1")))
        );

        let token = broker.subscribe("selection", noop_data(), None, None);
        broker.unsubscribe(&token, true);
        assert_eq!(broker.get_data("selection"), None);
    }

    #[test]
    fn test_validation_hook_screens_publishes() {
        let (mut broker, sink) = test_broker();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        broker.subscribe(
            "formData",
            noop_data(),
            Some(title_collector(errors.clone())),
            None,
        );

        let validator: ValidateCallback = Box::new(|_topic, payload| {
            if payload.as_substitution().is_empty() {
                Err(ErrorMsg::error("required", "value must not be empty"))
            } else {
                Ok(())
            }
        });
        broker.publish("formData", Payload::Json(json!("")), Some(validator));
        broker.flush_deliveries();

        assert_eq!(errors.lock().unwrap().as_slice(), ["required"]);
        assert_eq!(broker.get_data("formData"), None);

        // The stored hook keeps screening later publishes.
        broker.publish("formData", Payload::Json(json!("ada")), None);
        broker.flush_deliveries();
        assert_eq!(
            broker.get_data("formData"),
            Some(Payload::Json(json!("ada")))
        );
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_validation_slot_is_last_writer_wins() {
        let (mut broker, _sink) = test_broker();

        let reject_all: ValidateCallback =
            Box::new(|_, _| Err(ErrorMsg::error("nope", "rejected")));
        broker.publish("formData", Payload::Json(json!("first")), Some(reject_all));
        broker.flush_deliveries();
        assert_eq!(broker.get_data("formData"), None);

        let accept_all: ValidateCallback = Box::new(|_, _| Ok(()));
        broker.publish("formData", Payload::Json(json!("second")), Some(accept_all));
        broker.flush_deliveries();
        assert_eq!(
            broker.get_data("formData"),
            Some(Payload::Json(json!("second")))
        );
    }

    #[test]
    fn test_remote_publish_is_forwarded_not_looped_back() {
        let (mut broker, sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker.subscribe("/Pages/index.json", log_callback(log.clone(), "s"), None, None);
        broker.publish(
            "/Pages/index.json",
            Payload::Json(json!({"title": "Draft"})),
            None,
        );
        broker.flush_deliveries();

        // Subscribers hear about it through the server's echo, not locally.
        assert!(log.lock().unwrap().is_empty());
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[1], Frame::Publish { .. }));
        // The cache is updated immediately, though.
        assert!(broker.get_data("/Pages/index.json").is_some());

        broker.handle_publish("json:/studio/Pages/index.json", json!({"title": "Draft"}));
        broker.flush_deliveries();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resolution_uses_live_cached_values() {
        let (mut broker, _sink) = test_broker();
        broker.publish("currentPage", Payload::Json(json!("home")), None);
        broker.flush_deliveries();
        broker.handle_publish("json:/studio/Pages/home.json", json!({"title": "Home"}));
        broker.flush_deliveries();

        assert_eq!(
            broker.get_data("/Pages/${currentPage}.json"),
            Some(Payload::Json(json!({"title": "Home"})))
        );
    }

    #[test]
    fn test_set_current_app_changes_resolution() {
        let (mut broker, sink) = test_broker();
        broker.set_current_app("gallery");
        broker.subscribe("/Pages/index.json", noop_data(), None, None);

        let frames = sink.frames();
        assert!(matches!(
            &frames[0],
            Frame::Subscribe { topic, .. } if topic == "json:/gallery/Pages/index.json"
        ));
    }

    #[test]
    fn test_connection_notices_reach_subscribers() {
        let (mut broker, _sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker.subscribe(TOPIC_CONNECTION, log_callback(log.clone(), "conn"), None, None);
        broker.handle_notice(ErrorMsg::warning("connection lost", "retrying"));
        broker.flush_deliveries();

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].contains("connection lost"));
    }

    #[test]
    fn test_local_request_served_from_cache() {
        let (mut broker, sink) = test_broker();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let errors = Arc::new(StdMutex::new(Vec::new()));

        broker.publish("selection", Payload::Json(json!("page-1")), None);
        broker.flush_deliveries();

        broker.send_request("selection", log_callback(log.clone(), "req"), None, None);
        broker.flush_deliveries();
        assert_eq!(log.lock().unwrap().as_slice(), ["req:app:selection=page-1"]);

        // Without a cached value, the error callback fires instead.
        broker.send_request(
            "emptyTopic",
            noop_data(),
            Some(title_collector(errors.clone())),
            None,
        );
        broker.flush_deliveries();
        assert_eq!(errors.lock().unwrap().as_slice(), ["no data"]);
        assert_eq!(sink.frame_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_round_trip_over_command_loop() {
        let sink = RecordingSink::default();
        let hub = Hub::with_frame_sink("studio", Duration::from_secs(30), Box::new(sink.clone()));

        hub.publish("selection", Payload::Json(json!("page-1")), None)
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(StdMutex::new(Some(tx)));
        let token = hub
            .subscribe(
                "selection",
                Box::new(move |_topic, payload| {
                    if let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = tx.send(payload.as_substitution());
                    }
                }),
                None,
                None,
            )
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, "page-1");
        assert_eq!(token.topic, "selection");
        assert_eq!(
            hub.get_current_data("selection").await.unwrap(),
            Some(Payload::Json(json!("page-1")))
        );
        hub.shutdown().unwrap();
    }
}
