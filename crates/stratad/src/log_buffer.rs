//! Fixed-capacity ring of recent log records with live subscribers.
//!
//! [`LogBufferLayer`] plugs into the `tracing` registry so every event the
//! daemon emits lands here; admins read it back through `TailLogs`.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fields: String,
}

impl LogRecord {
    pub fn new(level: &str, target: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: target.to_string(),
            message: message.into(),
            fields: String::new(),
        }
    }
}

struct Inner {
    records: VecDeque<LogRecord>,
    subscribers: HashMap<u64, mpsc::Sender<LogRecord>>,
}

pub struct LogBuffer {
    capacity: usize,
    subscriber_queue: usize,
    inner: RwLock<Inner>,
    next_subscriber: AtomicU64,
    dropped: AtomicU64,
}

impl LogBuffer {
    pub fn new(capacity: usize, subscriber_queue: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            subscriber_queue: subscriber_queue.max(1),
            inner: RwLock::new(Inner {
                records: VecDeque::with_capacity(capacity),
                subscribers: HashMap::new(),
            }),
            next_subscriber: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append, overwriting the oldest record when full, and fan out to
    /// subscribers without blocking. A subscriber with a full queue misses
    /// this record.
    pub fn add(&self, record: LogRecord) {
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if inner.records.len() == self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record.clone());

        let mut closed = Vec::new();
        for (id, tx) in inner.subscribers.iter() {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            inner.subscribers.remove(&id);
        }
    }

    /// Up to `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogRecord> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let skip = inner.records.len().saturating_sub(n);
        inner.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .subscribers
            .len()
    }

    /// Records dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_queue);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .subscribers
            .insert(id, tx);

        Subscription {
            receiver: rx,
            unsubscribe: Unsubscribe {
                id,
                buffer: Arc::downgrade(self),
                done: AtomicBool::new(false),
            },
        }
    }

    fn remove_subscriber(&self, id: u64) {
        self.inner
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .subscribers
            .remove(&id);
    }
}

/// Idempotent unsubscribe handle.
pub struct Unsubscribe {
    id: u64,
    buffer: Weak<LogBuffer>,
    done: AtomicBool,
}

impl Unsubscribe {
    /// Remove the subscriber and close its channel. Later calls do nothing.
    pub fn call(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.remove_subscriber(self.id);
        }
    }
}

pub struct Subscription {
    receiver: mpsc::Receiver<LogRecord>,
    unsubscribe: Unsubscribe,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LogRecord> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(&self) {
        self.unsubscribe.call();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe.call();
    }
}

/// `tracing` layer that copies every event into a [`LogBuffer`].
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), &format!("{value:?}"));
        }
    }
}

impl RecordVisitor {
    fn push_field(&mut self, name: &str, value: &str) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        self.buffer.add(LogRecord {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(message: &str) -> LogRecord {
        LogRecord::new("INFO", "test", message)
    }

    #[test]
    fn ring_overwrites_oldest() {
        let buffer = LogBuffer::new(3, 8);
        for i in 0..5 {
            buffer.add(record(&format!("line {i}")));
        }
        let recent = buffer.recent(10);
        assert_eq!(
            recent.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(),
            vec!["line 2", "line 3", "line 4"]
        );
        assert_eq!(buffer.recent(1)[0].message, "line 4");
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_live_records() {
        let buffer = Arc::new(LogBuffer::new(10, 8));
        let mut sub = buffer.subscribe();
        buffer.add(record("hello"));
        assert_eq!(sub.recv().await.unwrap().message, "hello");
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let buffer = Arc::new(LogBuffer::new(10, 1));
        let mut sub = buffer.subscribe();
        buffer.add(record("first"));
        buffer.add(record("second"));

        assert_eq!(buffer.dropped(), 1);
        assert_eq!(sub.recv().await.unwrap().message, "first");
        assert_eq!(buffer.recent(10).len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_closes() {
        let buffer = Arc::new(LogBuffer::new(10, 8));
        let mut sub = buffer.subscribe();
        assert_eq!(buffer.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(buffer.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());

        buffer.add(record("after"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let buffer = Arc::new(LogBuffer::new(10, 8));
        let sub = buffer.subscribe();
        drop(sub);
        assert_eq!(buffer.subscriber_count(), 0);
    }

    #[test]
    fn layer_captures_events_with_fields() {
        let buffer = Arc::new(LogBuffer::new(10, 8));
        let subscriber =
            tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(user_id = "u1", count = 2, "Something happened");
        });

        let recent = buffer.recent(1);
        assert_eq!(recent[0].message, "Something happened");
        assert_eq!(recent[0].level, "WARN");
        assert!(recent[0].fields.contains("user_id=u1"));
        assert!(recent[0].fields.contains("count=2"));
    }
}
