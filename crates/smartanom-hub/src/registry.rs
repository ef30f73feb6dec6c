//! [`TopicRegistry`] – live membership of every broadcast topic.
//!
//! Maps each [`TopicKey`] to the [`ConnectionHandle`]s currently subscribed
//! to it. Topics are created on first join and reclaimed when their last
//! handle leaves.
//!
//! The map is sharded ([`DashMap`]), so join/leave/snapshot on one topic only
//! contend with operations on topics that hash to the same shard. Every
//! operation runs under that shard's lock, which makes membership changes
//! linearizable with respect to snapshots: a broadcast either sees a handle or
//! it does not.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use smartanom_types::{SmartanomError, TopicKey};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Handle identity and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionHandle
// ─────────────────────────────────────────────────────────────────────────────

/// The send side of one connection: its identity, its bound topic, a bounded
/// outbound queue and its lifecycle state.
///
/// Cheap to clone; clones share the queue and the state.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: HandleId,
    topic: TopicKey,
    tx: mpsc::Sender<Arc<str>>,
    state: Arc<AtomicU8>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle in the [`ConnectionState::Connecting`] state together
    /// with the receiving end of its outbound queue.
    ///
    /// `buffer` is the queue capacity; pushes beyond it are dropped.
    pub fn new(topic: TopicKey, buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: HandleId::new(),
            topic,
            tx,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn topic(&self) -> TopicKey {
        self.topic
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queue `payload` without waiting.
    ///
    /// # Errors
    ///
    /// [`SmartanomError::DeliveryDrop`] when the handle is not open, its
    /// queue is full, or its receiver has gone away.
    pub fn push(&self, payload: Arc<str>) -> Result<(), SmartanomError> {
        if !self.is_open() {
            return Err(self.drop_error("handle is not open"));
        }
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => self.drop_error("outbound buffer full"),
            TrySendError::Closed(_) => self.drop_error("receiver closed"),
        })
    }

    fn drop_error(&self, reason: &str) -> SmartanomError {
        SmartanomError::DeliveryDrop {
            handle: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TopicRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Concurrent topic → live handles map.
#[derive(Default)]
pub struct TopicRegistry {
    topics: DashMap<TopicKey, HashMap<HandleId, ConnectionHandle>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to its bound topic, creating the topic if absent.
    ///
    /// Idempotent: returns `false` when the handle was already a member.
    pub fn join(&self, handle: ConnectionHandle) -> bool {
        let mut members = self.topics.entry(handle.topic()).or_default();
        members.insert(handle.id(), handle).is_none()
    }

    /// Remove a handle from `topic`, reclaiming the topic once it is empty.
    ///
    /// Returns `true` when the handle was a member.
    pub fn leave(&self, topic: TopicKey, id: HandleId) -> bool {
        let removed = match self.topics.get_mut(&topic) {
            Some(mut members) => members.remove(&id).is_some(),
            None => false,
        };
        self.topics.remove_if(&topic, |_, members| members.is_empty());
        removed
    }

    /// The handles live in `topic` as of this call.
    pub fn snapshot(&self, topic: TopicKey) -> Vec<ConnectionHandle> {
        self.topics
            .get(&topic)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: TopicKey) -> usize {
        self.topics.get(&topic).map_or(0, |members| members.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn connection_count(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_handle(topic: TopicKey) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
        let (handle, rx) = ConnectionHandle::new(topic, 8);
        handle.set_state(ConnectionState::Open);
        (handle, rx)
    }

    #[test]
    fn join_creates_topic_lazily() {
        let registry = TopicRegistry::new();
        assert_eq!(registry.topic_count(), 0);

        let (handle, _rx) = open_handle(TopicKey::Sensor(5));
        assert!(registry.join(handle.clone()));

        assert_eq!(registry.topic_count(), 1);
        let snapshot = registry.snapshot(TopicKey::Sensor(5));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), handle.id());
    }

    #[test]
    fn join_is_idempotent() {
        let registry = TopicRegistry::new();
        let (handle, _rx) = open_handle(TopicKey::Global);
        assert!(registry.join(handle.clone()));
        assert!(!registry.join(handle.clone()));
        assert_eq!(registry.subscriber_count(TopicKey::Global), 1);
    }

    #[test]
    fn leave_reclaims_empty_topic() {
        let registry = TopicRegistry::new();
        let (a, _ra) = open_handle(TopicKey::Device(1));
        let (b, _rb) = open_handle(TopicKey::Device(1));
        registry.join(a.clone());
        registry.join(b.clone());

        assert!(registry.leave(TopicKey::Device(1), a.id()));
        assert_eq!(registry.topic_count(), 1);
        assert!(registry.leave(TopicKey::Device(1), b.id()));
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.snapshot(TopicKey::Device(1)).is_empty());
    }

    #[test]
    fn leave_unknown_handle_is_harmless() {
        let registry = TopicRegistry::new();
        assert!(!registry.leave(TopicKey::Global, HandleId::new()));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn topics_are_isolated() {
        let registry = TopicRegistry::new();
        let (device, _rd) = open_handle(TopicKey::Device(3));
        let (sensor, _rs) = open_handle(TopicKey::Sensor(3));
        registry.join(device);
        registry.join(sensor);

        assert_eq!(registry.subscriber_count(TopicKey::Device(3)), 1);
        assert_eq!(registry.subscriber_count(TopicKey::Sensor(3)), 1);
        assert_eq!(registry.subscriber_count(TopicKey::Global), 0);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn push_requires_open_state() {
        let (handle, mut rx) = ConnectionHandle::new(TopicKey::Global, 4);
        assert_eq!(handle.state(), ConnectionState::Connecting);
        assert!(handle.push(Arc::from("early")).is_err());

        handle.set_state(ConnectionState::Open);
        handle.push(Arc::from("hello")).unwrap();
        assert_eq!(&*rx.try_recv().unwrap(), "hello");

        handle.set_state(ConnectionState::Closed);
        let err = handle.push(Arc::from("late")).unwrap_err();
        assert!(matches!(err, SmartanomError::DeliveryDrop { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_on_full_buffer_drops_instead_of_blocking() {
        let (handle, mut rx) = ConnectionHandle::new(TopicKey::Global, 1);
        handle.set_state(ConnectionState::Open);

        handle.push(Arc::from("first")).unwrap();
        let err = handle.push(Arc::from("second")).unwrap_err();
        assert!(err.to_string().contains("outbound buffer full"));

        assert_eq!(&*rx.try_recv().unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_after_receiver_dropped_reports_closed() {
        let (handle, rx) = open_handle(TopicKey::Global);
        drop(rx);
        let err = handle.push(Arc::from("gone")).unwrap_err();
        assert!(err.to_string().contains("receiver closed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_join_and_leave_across_topics() {
        let registry = Arc::new(TopicRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..64i64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let topic = match i % 3 {
                    0 => TopicKey::Global,
                    1 => TopicKey::Device(i % 5),
                    _ => TopicKey::Sensor(i % 7),
                };
                let (handle, rx) = open_handle(topic);
                registry.join(handle.clone());
                tokio::task::yield_now().await;
                let seen = registry
                    .snapshot(topic)
                    .iter()
                    .any(|h| h.id() == handle.id());
                registry.leave(topic, handle.id());
                drop(rx);
                seen
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap(), "a joined handle must see itself");
        }
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.topic_count(), 0);
    }
}
