//! Per-topic registry state and deferred delivery.
//!
//! A [`TopicEntry`] holds everything the broker knows about one resolved
//! topic: the cached value, the last error, the registered callbacks in
//! subscription order, a single-slot validation hook, and an optional paging
//! filter.
//!
//! Deliveries are never invoked inside the operation that caused them.
//! Operations enqueue onto a [`DeliveryQueue`]; the broker drains the queue
//! only after the current operation completes, so code immediately following
//! a subscribe call always runs before the first delivery, even when the
//! value was already cached.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use protocol::{ErrorMsg, Filter, Payload};
use serde_json::Value;
use uuid::Uuid;

/// Identifier tying a subscription token to the exact callback instances it
/// registered.
pub type CallbackId = Uuid;

/// Callback receiving `(topic, data)` on delivery.
pub type DataCallback = Box<dyn FnMut(&str, &Payload) + Send>;

/// Callback receiving `(topic, error)` on failures.
pub type ErrorCallback = Box<dyn FnMut(&str, &ErrorMsg) + Send>;

/// Screens a published value before it is stored or forwarded.
pub type ValidateCallback =
    Box<dyn FnMut(&str, &Payload) -> std::result::Result<(), ErrorMsg> + Send>;

/// State of one resolved topic.
pub struct TopicEntry {
    topic: String,
    /// Cached value, if any has been published or received.
    pub data: Option<Payload>,
    /// Last error reported for this topic.
    pub error: Option<ErrorMsg>,
    /// Paging/sort restriction attached to the subscription.
    pub filter: Option<Filter>,
    /// Single-slot validation hook; the last publish that supplies one wins.
    pub validate: Option<ValidateCallback>,
    callbacks: Vec<(CallbackId, DataCallback)>,
    error_callbacks: Vec<(CallbackId, ErrorCallback)>,
}

impl TopicEntry {
    /// Creates an empty entry for a resolved topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: None,
            error: None,
            filter: None,
            validate: None,
            callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    /// Returns the resolved topic this entry belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registers a subscriber's callbacks under one id, in arrival order.
    pub fn add_callbacks(
        &mut self,
        id: CallbackId,
        on_data: Option<DataCallback>,
        on_error: Option<ErrorCallback>,
    ) {
        if let Some(on_data) = on_data {
            self.callbacks.push((id, on_data));
        }
        if let Some(on_error) = on_error {
            self.error_callbacks.push((id, on_error));
        }
    }

    /// Removes every callback registered under the id.
    pub fn remove_callbacks(&mut self, id: CallbackId) {
        self.callbacks.retain(|(callback_id, _)| *callback_id != id);
        self.error_callbacks
            .retain(|(callback_id, _)| *callback_id != id);
    }

    /// Returns whether any callback remains registered.
    pub fn has_subscribers(&self) -> bool {
        !self.callbacks.is_empty() || !self.error_callbacks.is_empty()
    }

    /// Ids of all registered callbacks, data and error alike.
    pub fn callback_ids(&self) -> Vec<CallbackId> {
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

    /// Looks up one data callback for invocation during a queue drain.
    pub fn data_callback_mut(&mut self, id: CallbackId) -> Option<&mut DataCallback> {
        self.callbacks
            .iter_mut()
            .find(|(callback_id, _)| *callback_id == id)
            .map(|(_, callback)| callback)
    }

    /// Looks up one error callback for invocation during a queue drain.
    pub fn error_callback_mut(&mut self, id: CallbackId) -> Option<&mut ErrorCallback> {
        self.error_callbacks
            .iter_mut()
            .find(|(callback_id, _)| *callback_id == id)
            .map(|(_, callback)| callback)
    }

    /// Updates one key of the cached value, creating the parent object if
    /// absent.
    pub fn set_field_value(&mut self, field: &str, value: Value) {
        match self.data.as_mut() {
            Some(payload) => payload.set_field(field, value),
            None => {
                let mut payload = Payload::Json(Value::Object(serde_json::Map::new()));
                payload.set_field(field, value);
                self.data = Some(payload);
            }
        }
    }

    /// Schedules delivery of the cached value to a single callback.
    pub fn deliver(&self, id: CallbackId, queue: &mut DeliveryQueue) {
        if let Some(data) = &self.data {
            queue.push_data(self.topic.clone(), id, data.clone());
        }
    }

    /// Schedules delivery of one field of the cached value to a single
    /// callback, addressed as `target_topic`.
    ///
    /// Fires only if the cached value is a structured object and the field
    /// is present and defined.
    pub fn deliver_field(
        &self,
        field: &str,
        target_topic: &str,
        id: CallbackId,
        queue: &mut DeliveryQueue,
    ) {
        if let Some(value) = self.data.as_ref().and_then(|data| data.field(field)) {
            queue.push_data(target_topic.to_string(), id, Payload::Json(value.clone()));
        }
    }

    /// Schedules delivery of the cached value to every registered callback,
    /// in registration order.
    pub fn call_callbacks(&self, queue: &mut DeliveryQueue) {
        if let Some(data) = &self.data {
            for (id, _) in &self.callbacks {
                queue.push_data(self.topic.clone(), *id, data.clone());
            }
        }
    }

    /// Schedules delivery of the stored error to every error callback, in
    /// registration order.
    pub fn call_error_callbacks(&self, queue: &mut DeliveryQueue) {
        if let Some(error) = &self.error {
            for (id, _) in &self.error_callbacks {
                queue.push_error(self.topic.clone(), *id, error.clone());
            }
        }
    }
}

impl std::fmt::Debug for TopicEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicEntry")
            .field("topic", &self.topic)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("filter", &self.filter)
            .field("callbacks", &self.callbacks.len())
            .field("error_callbacks", &self.error_callbacks.len())
            .finish()
    }
}

/// One scheduled delivery.
///
/// Entry-addressed deliveries are looked up at drain time, so a subscriber
/// that unsubscribes between scheduling and draining is skipped. Owned
/// deliveries carry their callback because the entry that held it (a
/// one-shot request) has already been discarded.
pub enum Delivery {
    /// Data for a callback still registered on an entry.
    Data {
        topic: String,
        target: CallbackId,
        payload: Payload,
    },
    /// Error for an error callback still registered on an entry.
    Error {
        topic: String,
        target: CallbackId,
        error: ErrorMsg,
    },
    /// Data for a one-shot callback whose entry is gone.
    OwnedData {
        topic: String,
        callback: DataCallback,
        payload: Payload,
    },
    /// Error for a one-shot error callback whose entry is gone.
    OwnedError {
        topic: String,
        callback: ErrorCallback,
        error: ErrorMsg,
    },
}

/// Deferred delivery queue, drained FIFO after the operation that filled it.
#[derive(Default)]
pub struct DeliveryQueue {
    items: VecDeque<Delivery>,
}

impl DeliveryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules data for a registered callback.
    pub fn push_data(&mut self, topic: String, target: CallbackId, payload: Payload) {
        self.items.push_back(Delivery::Data {
            topic,
            target,
            payload,
        });
    }

    /// Schedules an error for a registered error callback.
    pub fn push_error(&mut self, topic: String, target: CallbackId, error: ErrorMsg) {
        self.items.push_back(Delivery::Error {
            topic,
            target,
            error,
        });
    }

    /// Schedules data for a one-shot callback.
    pub fn push_owned_data(&mut self, topic: String, callback: DataCallback, payload: Payload) {
        self.items.push_back(Delivery::OwnedData {
            topic,
            callback,
            payload,
        });
    }

    /// Schedules an error for a one-shot error callback.
    pub fn push_owned_error(&mut self, topic: String, callback: ErrorCallback, error: ErrorMsg) {
        self.items.push_back(Delivery::OwnedError {
            topic,
            callback,
            error,
        });
    }

    /// Takes the next scheduled delivery.
    pub fn pop(&mut self) -> Option<Delivery> {
        self.items.pop_front()
    }

    /// Returns whether anything is scheduled.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of scheduled deliveries.
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Invokes a data callback, isolating panics so one failing consumer cannot
/// block delivery to the rest.
pub fn invoke_data_callback(callback: &mut DataCallback, topic: &str, payload: &Payload) {
    if catch_unwind(AssertUnwindSafe(|| callback(topic, payload))).is_err() {
        tracing::error!(topic, "data callback panicked during delivery");
    }
}

/// Invokes an error callback, isolating panics.
pub fn invoke_error_callback(callback: &mut ErrorCallback, topic: &str, error: &ErrorMsg) {
    if catch_unwind(AssertUnwindSafe(|| callback(topic, error))).is_err() {
        tracing::error!(topic, "error callback panicked during delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn collecting_callback(log: Arc<Mutex<Vec<String>>>) -> DataCallback {
        Box::new(move |topic, payload| {
            log.lock()
                .unwrap()
                .push(format!("{topic}={}", payload.as_substitution()));
        })
    }

    #[test]
    fn test_deliveries_are_deferred_until_drained() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entry = TopicEntry::new("app:selection");
        let mut queue = DeliveryQueue::new();

        let id = CallbackId::new_v4();
        entry.add_callbacks(id, Some(collecting_callback(log.clone())), None);
        entry.data = Some(Payload::Json(json!("page-1")));
        entry.call_callbacks(&mut queue);

        // Nothing runs until the owner drains the queue.
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 1);

        while let Some(delivery) = queue.pop() {
            if let Delivery::Data {
                topic,
                target,
                payload,
            } = delivery
            {
                if let Some(callback) = entry.data_callback_mut(target) {
                    invoke_data_callback(callback, &topic, &payload);
                }
            }
        }
        assert_eq!(log.lock().unwrap().as_slice(), ["app:selection=page-1"]);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entry = TopicEntry::new("app:selection");
        let mut queue = DeliveryQueue::new();

        for label in ["first", "second", "third"] {
            let log = log.clone();
            entry.add_callbacks(
                CallbackId::new_v4(),
                Some(Box::new(move |_, _| {
                    log.lock().unwrap().push(label.to_string());
                })),
                None,
            );
        }
        entry.data = Some(Payload::Json(json!(1)));
        entry.call_callbacks(&mut queue);

        while let Some(delivery) = queue.pop() {
            if let Delivery::Data { target, payload, topic } = delivery {
                if let Some(callback) = entry.data_callback_mut(target) {
                    invoke_data_callback(callback, &topic, &payload);
                }
            }
        }
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["first", "second", "third"]
        );
    }

    #[test]
    fn test_panicking_callback_does_not_block_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entry = TopicEntry::new("app:selection");
        let mut queue = DeliveryQueue::new();

        entry.add_callbacks(
            CallbackId::new_v4(),
            Some(Box::new(|_, _| panic!("consumer bug"))),
            None,
        );
        entry.add_callbacks(CallbackId::new_v4(), Some(collecting_callback(log.clone())), None);
        entry.data = Some(Payload::Json(json!("x")));
        entry.call_callbacks(&mut queue);

        while let Some(delivery) = queue.pop() {
            if let Delivery::Data { target, payload, topic } = delivery {
                if let Some(callback) = entry.data_callback_mut(target) {
                    invoke_data_callback(callback, &topic, &payload);
                }
            }
        }
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deliver_field_requires_present_field() {
        let mut entry = TopicEntry::new("app:formData");
        let mut queue = DeliveryQueue::new();
        let id = CallbackId::new_v4();

        // No data at all: nothing scheduled.
        entry.deliver_field("username", "app:formData#username", id, &mut queue);
        assert!(queue.is_empty());

        // Object without the field: nothing scheduled.
        entry.data = Some(Payload::Json(json!({"other": 1})));
        entry.deliver_field("username", "app:formData#username", id, &mut queue);
        assert!(queue.is_empty());

        // Present field: scheduled.
        entry.data = Some(Payload::Json(json!({"username": "ada"})));
        entry.deliver_field("username", "app:formData#username", id, &mut queue);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_set_field_value_creates_parent_object() {
        let mut entry = TopicEntry::new("app:formData");
        entry.set_field_value("username", json!("ada"));
        assert_eq!(entry.data, Some(Payload::Json(json!({"username": "ada"}))));

        entry.set_field_value("role", json!("admin"));
        assert_eq!(
            entry.data,
            Some(Payload::Json(json!({"username": "ada", "role": "admin"})))
        );
    }

    #[test]
    fn test_remove_callbacks_by_id() {
        let mut entry = TopicEntry::new("app:selection");
        let keep = CallbackId::new_v4();
        let drop = CallbackId::new_v4();

        entry.add_callbacks(keep, Some(Box::new(|_, _| {})), Some(Box::new(|_, _| {})));
        entry.add_callbacks(drop, Some(Box::new(|_, _| {})), None);
        assert_eq!(entry.callback_ids().len(), 2);

        entry.remove_callbacks(drop);
        assert_eq!(entry.callback_ids(), vec![keep]);
        assert!(entry.has_subscribers());

        entry.remove_callbacks(keep);
        assert!(!entry.has_subscribers());
    }
}
