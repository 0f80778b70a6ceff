//! Messaging collaborator contract.
//!
//! The default source and sink talk to the message bus only through these
//! traits. `crate::bus::MemoryBus` is the in-process implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fnhost_api::BoxFuture;
use fnhost_api::error::PluginError;

use crate::config::{InitialPosition, SubscriptionType};

/// Position of a message within its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub topic: String,
    pub entry: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.entry)
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    pub event_time_ms: Option<i64>,
    pub publish_time_ms: i64,
    /// How many times this message was handed out before this delivery.
    pub redelivery_count: u32,
}

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub value: Vec<u8>,
    pub key: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub event_time_ms: Option<i64>,
    /// Producer-assigned sequence id. A message whose id is not greater than
    /// the last one accepted from the same producer is dropped as a duplicate.
    pub sequence_id: Option<u64>,
}

impl OutgoingMessage {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Published(MessageId),
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topics: Vec<String>,
    pub topics_pattern: Option<String>,
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub initial_position: InitialPosition,
    /// Redeliver messages not acknowledged within this interval.
    pub ack_timeout: Option<Duration>,
    /// Topic (or the pattern itself) → schema type the consumer expects.
    pub schema_types: BTreeMap<String, String>,
}

impl SubscribeOptions {
    pub fn topics(topics: impl IntoIterator<Item = impl Into<String>>, subscription: impl Into<String>) -> Self {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            topics_pattern: None,
            subscription: subscription.into(),
            subscription_type: SubscriptionType::default(),
            initial_position: InitialPosition::default(),
            ack_timeout: None,
            schema_types: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub topic: String,
    /// Identity used for sequence-id de-duplication.
    pub producer_name: String,
    /// Schema type the producer writes. `None` leaves the topic's schema alone.
    pub schema_type: Option<String>,
}

impl ProducerOptions {
    pub fn new(topic: impl Into<String>, producer_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            producer_name: producer_name.into(),
            schema_type: None,
        }
    }
}

pub trait Consumer: Send + Sync {
    /// Wait for the next message.
    fn receive(&self) -> BoxFuture<'_, Result<Message, PluginError>>;

    fn ack(&self, id: &MessageId) -> Result<(), PluginError>;

    /// Negative acknowledgement: schedule the message for redelivery.
    fn nack(&self, id: &MessageId) -> Result<(), PluginError>;

    fn close(&self) -> BoxFuture<'_, Result<(), PluginError>>;
}

pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    fn send(&self, message: OutgoingMessage) -> BoxFuture<'_, Result<SendOutcome, PluginError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), PluginError>>;
}

pub trait MessagingClient: Send + Sync {
    fn subscribe(&self, options: SubscribeOptions) -> BoxFuture<'_, Result<Arc<dyn Consumer>, PluginError>>;

    fn create_producer(&self, options: ProducerOptions) -> BoxFuture<'_, Result<Arc<dyn Producer>, PluginError>>;
}
