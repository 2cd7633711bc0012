//! Maps progress tokens to subscribers (§4.2, invariant 2 in §8).

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::model::ProgressToken;

/// A progress subscriber is a callback invoked once per progress
/// notification. It is boxed because callers register closures (typically
/// forwarding into a channel the caller is awaiting on).
pub type ProgressSubscriber = Box<dyn Fn(Value) + Send + Sync>;

/// Registry of live progress subscriptions, keyed by the token the engine
/// injected into `_meta.progressToken` when the request was sent.
#[derive(Default)]
pub struct ProgressManager {
    subscribers: Mutex<HashMap<ProgressToken, ProgressSubscriber>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: ProgressToken, subscriber: ProgressSubscriber) {
        self.subscribers.lock().unwrap().insert(token, subscriber);
    }

    pub fn remove(&self, token: &ProgressToken) {
        self.subscribers.lock().unwrap().remove(token);
    }

    /// Deliver `payload` to the subscriber for `token`, if any. Returns
    /// `false` for an unknown token so the caller can raise the observable
    /// error §8 invariant 2 requires ("tokens without a subscriber produce
    /// an observable error and no delivery").
    pub fn deliver(&self, token: &ProgressToken, payload: Value) -> bool {
        let subscribers = self.subscribers.lock().unwrap();
        match subscribers.get(token) {
            Some(subscriber) => {
                subscriber(payload);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, token: &ProgressToken) -> bool {
        self.subscribers.lock().unwrap().contains_key(token)
    }
}
