use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// How a record was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ack,
    Fail,
}

/// Completion state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Acked,
    Failed,
}

type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const FAILED: u8 = 2;

/// One unit of input read from a source.
///
/// Cloning is cheap and every clone refers to the same completion slot:
/// only the first `ack()`/`fail()` across all clones takes effect.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

struct RecordInner {
    value: Option<Vec<u8>>,
    key: Option<String>,
    topic: Option<String>,
    partition: Option<i32>,
    message_id: Option<String>,
    sequence_id: Option<u64>,
    event_time_ms: Option<i64>,
    properties: BTreeMap<String, String>,
    dead_letter_topic: Option<String>,
    state: AtomicU8,
    on_complete: Mutex<Option<CompletionFn>>,
}

impl Record {
    /// Start building a record carrying `value`.
    pub fn builder(value: impl Into<Vec<u8>>) -> RecordBuilder {
        RecordBuilder::new(Some(value.into()))
    }

    /// Start building a record with no value (a tombstone). The instance
    /// rejects such records as a broken source.
    pub fn builder_without_value() -> RecordBuilder {
        RecordBuilder::new(None)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.inner.value.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.inner.topic.as_deref()
    }

    pub fn partition(&self) -> Option<i32> {
        self.inner.partition
    }

    pub fn message_id(&self) -> Option<&str> {
        self.inner.message_id.as_deref()
    }

    pub fn sequence_id(&self) -> Option<u64> {
        self.inner.sequence_id
    }

    pub fn event_time_ms(&self) -> Option<i64> {
        self.inner.event_time_ms
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.inner.properties
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.inner.dead_letter_topic.as_deref()
    }

    /// Acknowledge the record. Returns `false` if it was already completed.
    pub fn ack(&self) -> bool {
        self.complete(Completion::Ack)
    }

    /// Fail the record, making it eligible for redelivery. Returns `false`
    /// if it was already completed.
    pub fn fail(&self) -> bool {
        self.complete(Completion::Fail)
    }

    pub fn state(&self) -> RecordState {
        match self.inner.state.load(Ordering::Acquire) {
            ACKED => RecordState::Acked,
            FAILED => RecordState::Failed,
            _ => RecordState::Pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state() != RecordState::Pending
    }

    fn complete(&self, completion: Completion) -> bool {
        let target = match completion {
            Completion::Ack => ACKED,
            Completion::Fail => FAILED,
        };
        if self
            .inner
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let callback = match self.inner.on_complete.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback(completion);
        }
        true
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("topic", &self.inner.topic)
            .field("message_id", &self.inner.message_id)
            .field("key", &self.inner.key)
            .field("value_len", &self.inner.value.as_ref().map(Vec::len))
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Record`].
pub struct RecordBuilder {
    value: Option<Vec<u8>>,
    key: Option<String>,
    topic: Option<String>,
    partition: Option<i32>,
    message_id: Option<String>,
    sequence_id: Option<u64>,
    event_time_ms: Option<i64>,
    properties: BTreeMap<String, String>,
    dead_letter_topic: Option<String>,
    on_complete: Option<CompletionFn>,
}

impl RecordBuilder {
    fn new(value: Option<Vec<u8>>) -> Self {
        Self {
            value,
            key: None,
            topic: None,
            partition: None,
            message_id: None,
            sequence_id: None,
            event_time_ms: None,
            properties: BTreeMap::new(),
            dead_letter_topic: None,
            on_complete: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn sequence_id(mut self, seq: u64) -> Self {
        self.sequence_id = Some(seq);
        self
    }

    pub fn event_time_ms(mut self, ts: i64) -> Self {
        self.event_time_ms = Some(ts);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Callback run once, by whichever of `ack()`/`fail()` comes first.
    pub fn on_complete(mut self, f: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Record {
        Record {
            inner: Arc::new(RecordInner {
                value: self.value,
                key: self.key,
                topic: self.topic,
                partition: self.partition,
                message_id: self.message_id,
                sequence_id: self.sequence_id,
                event_time_ms: self.event_time_ms,
                properties: self.properties,
                dead_letter_topic: self.dead_letter_topic,
                state: AtomicU8::new(PENDING),
                on_complete: Mutex::new(self.on_complete),
            }),
        }
    }
}
