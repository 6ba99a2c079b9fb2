//! Loopback channel
//!
//! Plays the host side in process: records every call, answers with canned
//! responses and lets the caller push events to subscribed listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::Channel;
use crate::types::{Result, WormholeError};

/// A call received by an [`InMemoryChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
}

/// In-process [`Channel`] for tests and local tooling
pub struct InMemoryChannel {
    open: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    responses: DashMap<String, Value>,
    failures: DashMap<String, String>,
    subscriptions: DashSet<String>,
    listeners: DashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    call_notify: Notify,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    /// An open channel answering every call with `{"ok": true}`
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            responses: DashMap::new(),
            failures: DashMap::new(),
            subscriptions: DashSet::new(),
            listeners: DashMap::new(),
            call_notify: Notify::new(),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Answer every call to `method` with `response`
    pub fn respond_with(&self, method: &str, response: Value) {
        self.responses.insert(method.to_string(), response);
    }

    /// Fail every call to `method` with a channel error
    pub fn fail_method(&self, method: &str, message: &str) {
        self.failures.insert(method.to_string(), message.to_string());
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<RecordedCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call received so far, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.recorded().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.recorded()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Currently subscribed events, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut events: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        events.sort();
        events
    }

    /// Push `payload` on `event` as the host would.
    ///
    /// Returns how many listeners received it. Nothing is delivered for an
    /// event nobody subscribed to.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        if !self.subscriptions.contains(event) {
            debug!(event = %event, "Dropping push for unsubscribed event");
            return 0;
        }
        let Some(mut listeners) = self.listeners.get_mut(event) else {
            return 0;
        };
        listeners.retain(|tx| tx.send(payload.clone()).is_ok());
        listeners.len()
    }

    /// Wait until `method` has been called, up to `timeout`.
    pub async fn wait_for_call(&self, method: &str, timeout: Duration) -> Option<RecordedCall> {
        self.wait_for_calls(method, 1, timeout).await.into_iter().next()
    }

    /// Wait until `method` has been called `count` times, up to `timeout`.
    /// Returns whatever calls arrived.
    pub async fn wait_for_calls(
        &self,
        method: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<RecordedCall> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.call_notify.notified();
            let calls = self.calls_to(method);
            if calls.len() >= count {
                return calls;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.calls_to(method);
            }
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_open() {
            return Err(WormholeError::Channel("channel closed".into()));
        }

        self.recorded().push(RecordedCall {
            method: method.to_string(),
            params,
        });
        self.call_notify.notify_waiters();

        if let Some(message) = self.failures.get(method) {
            return Err(WormholeError::Channel(message.value().clone()));
        }
        Ok(self
            .responses
            .get(method)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| json!({ "ok": true })))
    }

    async fn subscribe(&self, event: &str) -> Result<()> {
        self.subscriptions.insert(event.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, event: &str) -> Result<()> {
        self.subscriptions.remove(event);
        self.listeners.remove(event);
        Ok(())
    }

    fn on(&self, event: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.entry(event.to_string()).or_default().push(tx);
        rx
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_default_response() {
        let channel = InMemoryChannel::new();
        let resp = channel.call("holo/identify", json!({ "agentId": "u1" })).await.unwrap();

        assert_eq!(resp, json!({ "ok": true }));
        assert_eq!(
            channel.calls(),
            vec![RecordedCall {
                method: "holo/identify".into(),
                params: json!({ "agentId": "u1" }),
            }]
        );
    }

    #[tokio::test]
    async fn test_canned_response_and_failure() {
        let channel = InMemoryChannel::new();
        channel.respond_with("holo/call", json!({ "Ok": 5 }));
        channel.fail_method("holo/identify", "nope");

        assert_eq!(channel.call("holo/call", json!({})).await.unwrap(), json!({ "Ok": 5 }));
        assert!(matches!(
            channel.call("holo/identify", json!({})).await,
            Err(WormholeError::Channel(m)) if m == "nope"
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_calls() {
        let channel = InMemoryChannel::new();
        channel.close();
        assert!(!channel.is_open());
        assert!(channel.call("x", json!(null)).await.is_err());
        assert!(channel.calls().is_empty());

        channel.reopen();
        assert!(channel.call("x", json!(null)).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_requires_subscription() {
        let channel = InMemoryChannel::new();
        let mut rx = channel.on("evt");

        assert_eq!(channel.emit("evt", json!(1)), 0);

        channel.subscribe("evt").await.unwrap();
        assert_eq!(channel.emit("evt", json!(2)), 1);
        assert_eq!(rx.recv().await, Some(json!(2)));

        channel.unsubscribe("evt").await.unwrap();
        assert_eq!(channel.emit("evt", json!(3)), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_wait_for_call_times_out() {
        let channel = InMemoryChannel::new();
        let call = channel
            .wait_for_call("never", Duration::from_millis(20))
            .await;
        assert!(call.is_none());
    }
}
