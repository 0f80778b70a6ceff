//! In-process message bus.
//!
//! Each topic is an append-only log. A named subscription keeps one cursor per
//! topic it covers, the set of handed-out but unacknowledged messages and a
//! redelivery queue. Every consumer attached to the same subscription name
//! shares that state: under `Shared` dispatch they compete for messages, under
//! `Failover` only the first attached consumer receives.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use regex::Regex;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use fnhost_api::BoxFuture;
use fnhost_api::error::PluginError;

use crate::config::{InitialPosition, SubscriptionType};
use crate::messaging::{
    Consumer, Message, MessageId, MessagingClient, OutgoingMessage, Producer, ProducerOptions,
    SendOutcome, SubscribeOptions,
};
use crate::stats::now_ms;
use crate::sync::{lock, read, write};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    value: Vec<u8>,
    properties: BTreeMap<String, String>,
    event_time_ms: Option<i64>,
    publish_time_ms: i64,
}

struct TopicLog {
    entries: RwLock<Vec<StoredMessage>>,
    /// Producer name → last accepted sequence id.
    last_sequence: Mutex<HashMap<String, u64>>,
    /// Fixed by the first producer or consumer that declares one.
    schema: Mutex<Option<String>>,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            last_sequence: Mutex::new(HashMap::new()),
            schema: Mutex::new(None),
        }
    }

    fn len(&self) -> u64 {
        read(&self.entries).len() as u64
    }

    fn get(&self, entry: u64) -> Option<StoredMessage> {
        read(&self.entries).get(entry as usize).cloned()
    }
}

enum TopicSelector {
    Explicit(Vec<String>),
    Pattern(Regex),
}

struct Unacked {
    consumer: u64,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct SubscriptionState {
    cursors: BTreeMap<String, u64>,
    redeliver: VecDeque<MessageId>,
    unacked: HashMap<MessageId, Unacked>,
    redelivery_counts: HashMap<MessageId, u32>,
    /// Attached consumers in attach order; the first one is the failover leader.
    consumers: Vec<u64>,
}

struct Subscription {
    name: String,
    kind: SubscriptionType,
    selector: TopicSelector,
    ack_timeout: Option<Duration>,
    state: Mutex<SubscriptionState>,
    notify: Notify,
}

impl Subscription {
    fn covers(&self, topic: &str) -> bool {
        match &self.selector {
            TopicSelector::Explicit(topics) => topics.iter().any(|t| t == topic),
            TopicSelector::Pattern(re) => re.is_match(topic),
        }
    }
}

enum Dispatch {
    Deliver(Message),
    /// Nothing available; wake up no later than the given ack deadline.
    Wait(Option<Instant>),
    Closed,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    next_consumer_id: AtomicU64,
}

impl BusInner {
    fn topic(&self, name: &str) -> Arc<TopicLog> {
        if let Some(t) = read(&self.topics).get(name) {
            return t.clone();
        }
        write(&self.topics)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .clone()
    }

    fn existing_topic(&self, name: &str) -> Option<Arc<TopicLog>> {
        read(&self.topics).get(name).cloned()
    }

    fn matching_topics(&self, re: &Regex) -> Vec<String> {
        let mut names: Vec<String> = read(&self.topics)
            .keys()
            .filter(|name| re.is_match(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn declare_schema(&self, topic: &str, schema: &str) -> Result<(), PluginError> {
        let log = self.topic(topic);
        let mut current = lock(&log.schema);
        match current.as_deref() {
            Some(existing) if existing != schema => Err(PluginError::config(format!(
                "topic '{topic}' has schema '{existing}', not '{schema}'"
            ))),
            Some(_) => Ok(()),
            None => {
                *current = Some(schema.to_string());
                Ok(())
            }
        }
    }

    /// Declare the consumer's schemas. A schema keyed by the subscription
    /// pattern applies to every topic the pattern currently matches.
    fn declare_consumer_schemas(&self, options: &SubscribeOptions) -> Result<(), PluginError> {
        for (key, schema) in &options.schema_types {
            if options.topics_pattern.as_deref() == Some(key.as_str()) {
                let re = Regex::new(key)
                    .map_err(|e| PluginError::config(format!("invalid topics pattern '{key}': {e}")))?;
                for topic in self.matching_topics(&re) {
                    self.declare_schema(&topic, schema)?;
                }
            } else {
                self.declare_schema(key, schema)?;
            }
        }
        Ok(())
    }

    fn publish(&self, topic: &str, producer: &str, message: OutgoingMessage) -> SendOutcome {
        let log = self.topic(topic);
        if let Some(seq) = message.sequence_id {
            let mut last = lock(&log.last_sequence);
            match last.get(producer) {
                Some(&prev) if seq <= prev => return SendOutcome::Duplicate,
                _ => {
                    last.insert(producer.to_string(), seq);
                }
            }
        }
        SendOutcome::Published(self.append(topic, &log, message))
    }

    fn append(&self, topic: &str, log: &TopicLog, message: OutgoingMessage) -> MessageId {
        let entry = {
            let mut entries = write(&log.entries);
            entries.push(StoredMessage {
                key: message.key,
                value: message.value,
                properties: message.properties,
                event_time_ms: message.event_time_ms,
                publish_time_ms: now_ms(),
            });
            entries.len() as u64 - 1
        };

        let subscriptions: Vec<Arc<Subscription>> = lock(&self.subscriptions).values().cloned().collect();
        for sub in subscriptions.iter().filter(|s| s.covers(topic)) {
            sub.notify.notify_waiters();
        }

        MessageId {
            topic: topic.to_string(),
            entry,
        }
    }

    fn subscription(&self, options: &SubscribeOptions) -> Result<Arc<Subscription>, PluginError> {
        let mut subs = lock(&self.subscriptions);
        if let Some(existing) = subs.get(&options.subscription) {
            return Ok(existing.clone());
        }

        let selector = match &options.topics_pattern {
            Some(pattern) => TopicSelector::Pattern(
                Regex::new(pattern)
                    .map_err(|e| PluginError::config(format!("invalid topics pattern '{pattern}': {e}")))?,
            ),
            None if options.topics.is_empty() => {
                return Err(PluginError::config("subscription needs at least one topic"));
            }
            None => TopicSelector::Explicit(options.topics.clone()),
        };

        let initial_topics = match &selector {
            TopicSelector::Explicit(topics) => topics.clone(),
            TopicSelector::Pattern(re) => self.matching_topics(re),
        };
        let mut state = SubscriptionState::default();
        for name in initial_topics {
            let start = match options.initial_position {
                InitialPosition::Earliest => 0,
                InitialPosition::Latest => self.topic(&name).len(),
            };
            state.cursors.insert(name, start);
        }

        let sub = Arc::new(Subscription {
            name: options.subscription.clone(),
            kind: options.subscription_type,
            selector,
            ack_timeout: options.ack_timeout,
            state: Mutex::new(state),
            notify: Notify::new(),
        });
        subs.insert(options.subscription.clone(), sub.clone());
        Ok(sub)
    }

    fn dispatch(&self, sub: &Subscription, consumer: u64) -> Dispatch {
        let mut guard = lock(&sub.state);
        let state = &mut *guard;

        if !state.consumers.contains(&consumer) {
            return Dispatch::Closed;
        }
        if sub.kind == SubscriptionType::Failover && state.consumers.first() != Some(&consumer) {
            return Dispatch::Wait(None);
        }

        let now = Instant::now();
        if sub.ack_timeout.is_some() {
            let expired: Vec<MessageId> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                tracing::debug!(subscription = %sub.name, message = %id, "ack timeout expired");
                state.unacked.remove(&id);
                *state.redelivery_counts.entry(id.clone()).or_default() += 1;
                state.redeliver.push_back(id);
            }
        }

        let deadline = sub.ack_timeout.map(|t| now + t);

        while let Some(id) = state.redeliver.pop_front() {
            let Some(stored) = self.existing_topic(&id.topic).and_then(|t| t.get(id.entry)) else {
                continue;
            };
            let count = state.redelivery_counts.get(&id).copied().unwrap_or(0);
            state.unacked.insert(id.clone(), Unacked { consumer, deadline });
            return Dispatch::Deliver(to_message(id, stored, count));
        }

        if let TopicSelector::Pattern(re) = &sub.selector {
            for name in self.matching_topics(re) {
                // Topics created after the subscription are read from the start.
                state.cursors.entry(name).or_insert(0);
            }
        }

        for (topic, cursor) in state.cursors.iter_mut() {
            let Some(stored) = self.existing_topic(topic).and_then(|t| t.get(*cursor)) else {
                continue;
            };
            let id = MessageId {
                topic: topic.clone(),
                entry: *cursor,
            };
            *cursor += 1;
            state.unacked.insert(id.clone(), Unacked { consumer, deadline });
            return Dispatch::Deliver(to_message(id, stored, 0));
        }

        Dispatch::Wait(state.unacked.values().filter_map(|u| u.deadline).min())
    }

    fn ack(&self, sub: &Subscription, id: &MessageId) {
        let mut state = lock(&sub.state);
        state.unacked.remove(id);
        state.redelivery_counts.remove(id);
    }

    fn nack(&self, sub: &Subscription, id: &MessageId) {
        {
            let mut state = lock(&sub.state);
            if state.unacked.remove(id).is_none() {
                return;
            }
            *state.redelivery_counts.entry(id.clone()).or_default() += 1;
            state.redeliver.push_back(id.clone());
        }
        sub.notify.notify_waiters();
    }

    fn detach(&self, sub: &Subscription, consumer: u64) {
        {
            let mut state = lock(&sub.state);
            state.consumers.retain(|c| *c != consumer);
            let orphaned: Vec<MessageId> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.consumer == consumer)
                .map(|(id, _)| id.clone())
                .collect();
            for id in orphaned {
                state.unacked.remove(&id);
                state.redeliver.push_back(id);
            }
        }
        sub.notify.notify_waiters();
    }
}

fn to_message(id: MessageId, stored: StoredMessage, redelivery_count: u32) -> Message {
    Message {
        id,
        key: stored.key,
        value: stored.value,
        properties: stored.properties,
        event_time_ms: stored.event_time_ms,
        publish_time_ms: stored.publish_time_ms,
        redelivery_count,
    }
}

/// In-process implementation of [`MessagingClient`].
///
/// Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish outside any producer (no de-duplication).
    pub fn publish(&self, topic: &str, value: impl Into<Vec<u8>>) -> MessageId {
        let log = self.inner.topic(topic);
        self.inner.append(topic, &log, OutgoingMessage::new(value))
    }

    /// Values currently stored in `topic`, oldest first.
    pub fn values(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .existing_topic(topic)
            .map(|t| read(&t.entries).iter().map(|m| m.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.topics).keys().cloned().collect();
        names.sort();
        names
    }

    /// Schema type fixed for `topic`, if any.
    pub fn schema_type(&self, topic: &str) -> Option<String> {
        self.inner.existing_topic(topic).and_then(|t| lock(&t.schema).clone())
    }

    /// Number of messages of `subscription` handed out and not yet acknowledged.
    pub fn unacked_count(&self, subscription: &str) -> usize {
        lock(&self.inner.subscriptions)
            .get(subscription)
            .map(|s| lock(&s.state).unacked.len())
            .unwrap_or(0)
    }
}

impl MessagingClient for MemoryBus {
    fn subscribe(&self, options: SubscribeOptions) -> BoxFuture<'_, Result<Arc<dyn Consumer>, PluginError>> {
        Box::pin(async move {
            self.inner.declare_consumer_schemas(&options)?;
            let subscription = self.inner.subscription(&options)?;
            let id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
            lock(&subscription.state).consumers.push(id);
            tracing::debug!(subscription = %subscription.name, consumer = id, "consumer attached");
            Ok(Arc::new(MemoryConsumer {
                bus: self.inner.clone(),
                subscription,
                id,
                closed: AtomicBool::new(false),
            }) as Arc<dyn Consumer>)
        })
    }

    fn create_producer(&self, options: ProducerOptions) -> BoxFuture<'_, Result<Arc<dyn Producer>, PluginError>> {
        Box::pin(async move {
            if options.topic.is_empty() {
                return Err(PluginError::config("producer topic must not be empty"));
            }
            match &options.schema_type {
                Some(schema) => self.inner.declare_schema(&options.topic, schema)?,
                None => {
                    self.inner.topic(&options.topic);
                }
            }
            Ok(Arc::new(MemoryProducer {
                bus: self.inner.clone(),
                topic: options.topic,
                name: options.producer_name,
                closed: AtomicBool::new(false),
            }) as Arc<dyn Producer>)
        })
    }
}

struct MemoryConsumer {
    bus: Arc<BusInner>,
    subscription: Arc<Subscription>,
    id: u64,
    closed: AtomicBool,
}

impl Consumer for MemoryConsumer {
    fn receive(&self) -> BoxFuture<'_, Result<Message, PluginError>> {
        Box::pin(async move {
            loop {
                let notified = self.subscription.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let wake_at = match self.bus.dispatch(&self.subscription, self.id) {
                    Dispatch::Deliver(message) => return Ok(message),
                    Dispatch::Closed => return Err(PluginError::closed("consumer is closed")),
                    Dispatch::Wait(deadline) => deadline,
                };

                match wake_at {
                    Some(deadline) => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }

    fn ack(&self, id: &MessageId) -> Result<(), PluginError> {
        self.bus.ack(&self.subscription, id);
        Ok(())
    }

    fn nack(&self, id: &MessageId) -> Result<(), PluginError> {
        self.bus.nack(&self.subscription, id);
        Ok(())
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.bus.detach(&self.subscription, self.id);
                tracing::debug!(subscription = %self.subscription.name, consumer = self.id, "consumer detached");
            }
            Ok(())
        })
    }
}

struct MemoryProducer {
    bus: Arc<BusInner>,
    topic: String,
    name: String,
    closed: AtomicBool,
}

impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send(&self, message: OutgoingMessage) -> BoxFuture<'_, Result<SendOutcome, PluginError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(PluginError::closed(format!("producer for '{}' is closed", self.topic)));
            }
            Ok(self.bus.publish(&self.topic, &self.name, message))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn consumer(bus: &MemoryBus, options: SubscribeOptions) -> Arc<dyn Consumer> {
        bus.subscribe(options).await.unwrap()
    }

    fn earliest(topics: &[&str], sub: &str) -> SubscribeOptions {
        let mut options = SubscribeOptions::topics(topics.iter().copied(), sub);
        options.initial_position = InitialPosition::Earliest;
        options
    }

    #[tokio::test]
    async fn latest_skips_existing_messages() {
        let bus = MemoryBus::new();
        bus.publish("in", "old");
        let c = consumer(&bus, SubscribeOptions::topics(["in"], "s")).await;
        bus.publish("in", "new");
        assert_eq!(c.receive().await.unwrap().value, b"new");
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let bus = MemoryBus::new();
        let c = consumer(&bus, earliest(&["in"], "s")).await;
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("in", "late");
        });
        assert_eq!(c.receive().await.unwrap().value, b"late");
    }

    #[tokio::test]
    async fn nack_redelivers_with_count() {
        let bus = MemoryBus::new();
        bus.publish("in", "v");
        let c = consumer(&bus, earliest(&["in"], "s")).await;

        let first = c.receive().await.unwrap();
        assert_eq!(first.redelivery_count, 0);
        c.nack(&first.id).unwrap();

        let second = c.receive().await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.redelivery_count, 1);
        c.ack(&second.id).unwrap();
        assert_eq!(bus.unacked_count("s"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_redelivers() {
        let bus = MemoryBus::new();
        bus.publish("in", "v");
        let mut options = earliest(&["in"], "s");
        options.ack_timeout = Some(Duration::from_secs(5));
        let c = consumer(&bus, options).await;

        let first = c.receive().await.unwrap();
        let again = c.receive().await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.redelivery_count, 1);
    }

    #[tokio::test]
    async fn shared_consumers_split_messages() {
        let bus = MemoryBus::new();
        let a = consumer(&bus, earliest(&["in"], "s")).await;
        let b = consumer(&bus, earliest(&["in"], "s")).await;
        bus.publish("in", "1");
        bus.publish("in", "2");

        let m1 = a.receive().await.unwrap();
        let m2 = b.receive().await.unwrap();
        assert_ne!(m1.id, m2.id);
    }

    #[tokio::test]
    async fn failover_hands_over_on_close() {
        let bus = MemoryBus::new();
        let mut options = earliest(&["in"], "s");
        options.subscription_type = SubscriptionType::Failover;
        let leader = consumer(&bus, options.clone()).await;
        let standby = consumer(&bus, options).await;
        bus.publish("in", "1");

        let m = leader.receive().await.unwrap();
        leader.close().await.unwrap();

        let handed_over = standby.receive().await.unwrap();
        assert_eq!(handed_over.id, m.id);
    }

    #[tokio::test]
    async fn pattern_picks_up_new_topics() {
        let bus = MemoryBus::new();
        let mut options = SubscribeOptions::topics(Vec::<String>::new(), "s");
        options.topics_pattern = Some("^in-.*".into());
        let c = consumer(&bus, options).await;

        bus.publish("other", "x");
        bus.publish("in-a", "a");
        let m = c.receive().await.unwrap();
        assert_eq!(m.id.topic, "in-a");
        assert_eq!(m.value, b"a");
    }

    #[tokio::test]
    async fn producer_drops_duplicate_sequence_ids() {
        let bus = MemoryBus::new();
        let p = bus
            .create_producer(ProducerOptions::new("out", "p"))
            .await
            .unwrap();

        let send = |seq| {
            let mut m = OutgoingMessage::new("v");
            m.sequence_id = Some(seq);
            m
        };
        assert!(matches!(p.send(send(1)).await.unwrap(), SendOutcome::Published(_)));
        assert_eq!(p.send(send(1)).await.unwrap(), SendOutcome::Duplicate);
        assert!(matches!(p.send(send(2)).await.unwrap(), SendOutcome::Published(_)));
        assert_eq!(bus.values("out").len(), 2);
    }

    #[tokio::test]
    async fn first_declared_schema_sticks() {
        let bus = MemoryBus::new();
        let mut options = ProducerOptions::new("out", "p");
        options.schema_type = Some("json".into());
        bus.create_producer(options.clone()).await.unwrap();
        assert_eq!(bus.schema_type("out").as_deref(), Some("json"));

        let mut sub = earliest(&["out"], "s");
        sub.schema_types.insert("out".into(), "json".into());
        bus.subscribe(sub.clone()).await.unwrap();

        sub.schema_types.insert("out".into(), "avro".into());
        let err = bus.subscribe(sub).await.err().unwrap();
        assert_eq!(err.kind, fnhost_api::error::ErrorKind::Config);

        options.schema_type = Some("bytes".into());
        assert!(bus.create_producer(options).await.is_err());
        assert!(bus.create_producer(ProducerOptions::new("out", "plain")).await.is_ok());
    }

    #[tokio::test]
    async fn closed_consumer_stops_receiving() {
        let bus = MemoryBus::new();
        let c = consumer(&bus, earliest(&["in"], "s")).await;
        c.close().await.unwrap();
        let err = c.receive().await.unwrap_err();
        assert_eq!(err.kind, fnhost_api::error::ErrorKind::Closed);
    }
}
