//! Default source: consumes the function's input topics from the messaging
//! client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fnhost_api::BoxFuture;
use fnhost_api::config::ConfigValues;
use fnhost_api::context::Context;
use fnhost_api::error::PluginError;
use fnhost_api::record::{Completion, Record};
use fnhost_api::source::Source;

use crate::config::{InitialPosition, InstanceConfig, ProcessingGuarantee, SubscriptionType};
use crate::messaging::{
    Consumer, Message, MessagingClient, OutgoingMessage, Producer, ProducerOptions, SubscribeOptions,
};

/// Property carrying the id of the message a dead-lettered copy came from.
pub const ORIGIN_MESSAGE_ID_PROPERTY: &str = "ORIGIN_MESSAGE_ID";
/// Property carrying the topic a dead-lettered copy came from.
pub const REAL_TOPIC_PROPERTY: &str = "REAL_TOPIC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Deliveries beyond this many redeliveries go to the dead-letter topic.
    pub max_redeliveries: u32,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub topics: Vec<String>,
    pub topics_pattern: Option<String>,
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub initial_position: InitialPosition,
    pub ack_timeout: Option<Duration>,
    pub dead_letter: Option<DeadLetterPolicy>,
    /// Input topic (or pattern) → declared schema type.
    pub schema_types: BTreeMap<String, String>,
}

impl SourceSettings {
    pub fn from_config(config: &InstanceConfig) -> Self {
        let details = &config.function;
        let spec = &details.source;

        let mut topics = Vec::new();
        let mut topics_pattern = spec.topics_pattern.clone();
        let mut schema_types = BTreeMap::new();
        for (topic, consumer) in &spec.inputs {
            if let Some(schema) = consumer.schema_type.as_ref().filter(|s| !s.is_empty()) {
                schema_types.insert(topic.clone(), schema.clone());
            }
            if consumer.is_regex_pattern {
                topics_pattern.get_or_insert_with(|| topic.clone());
            } else {
                topics.push(topic.clone());
            }
        }

        let subscription = spec
            .subscription_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| details.fully_qualified_name());

        let dead_letter = details.retry.as_ref().map(|retry| DeadLetterPolicy {
            max_redeliveries: retry.max_message_retries,
            topic: retry
                .dead_letter_topic
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| default_dead_letter_topic(&topics, topics_pattern.as_deref(), &subscription)),
        });

        // Sink de-duplication relies on one consumer seeing the input in order.
        let subscription_type = match details.processing_guarantees {
            ProcessingGuarantee::EffectivelyOnce => SubscriptionType::Failover,
            _ => spec.subscription_type,
        };

        Self {
            topics,
            topics_pattern,
            subscription,
            subscription_type,
            initial_position: spec.initial_position,
            ack_timeout: spec.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            dead_letter,
            schema_types,
        }
    }
}

/// `{first_input_topic}-{subscription}-DLQ`.
fn default_dead_letter_topic(topics: &[String], pattern: Option<&str>, subscription: &str) -> String {
    let topic = topics.first().map(String::as_str).or(pattern).unwrap_or("input");
    format!("{topic}-{subscription}-DLQ")
}

pub struct MessagingSource {
    client: Arc<dyn MessagingClient>,
    settings: SourceSettings,
    consumer: Option<Arc<dyn Consumer>>,
    dead_letter: Option<(u32, Arc<dyn Producer>)>,
}

impl MessagingSource {
    pub fn new(client: Arc<dyn MessagingClient>, settings: SourceSettings) -> Self {
        Self {
            client,
            settings,
            consumer: None,
            dead_letter: None,
        }
    }

    async fn send_to_dead_letter(&self, producer: &dyn Producer, consumer: &dyn Consumer, message: Message) -> Result<(), PluginError> {
        let mut properties = message.properties;
        properties.insert(ORIGIN_MESSAGE_ID_PROPERTY.to_string(), message.id.to_string());
        properties.insert(REAL_TOPIC_PROPERTY.to_string(), message.id.topic.clone());

        tracing::warn!(
            message = %message.id,
            redeliveries = message.redelivery_count,
            topic = %producer.topic(),
            "redelivery limit reached, dead-lettering record"
        );
        producer
            .send(OutgoingMessage {
                value: message.value,
                key: message.key,
                properties,
                event_time_ms: message.event_time_ms,
                sequence_id: None,
            })
            .await?;
        consumer.ack(&message.id)
    }

    fn to_record(&self, consumer: Arc<dyn Consumer>, message: Message) -> Record {
        let id = message.id;
        let mut builder = Record::builder(message.value)
            .topic(id.topic.clone())
            .message_id(id.to_string())
            .sequence_id(id.entry)
            .properties(message.properties);
        if let Some(key) = message.key {
            builder = builder.key(key);
        }
        if let Some(ts) = message.event_time_ms {
            builder = builder.event_time_ms(ts);
        }
        if let Some(policy) = &self.settings.dead_letter {
            builder = builder.dead_letter_topic(policy.topic.clone());
        }
        builder
            .on_complete(move |completion| {
                let result = match completion {
                    Completion::Ack => consumer.ack(&id),
                    Completion::Fail => consumer.nack(&id),
                };
                if let Err(e) = result {
                    tracing::warn!(message = %id, ?completion, error = %e, "failed to complete record");
                }
            })
            .build()
    }
}

impl Source for MessagingSource {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            let s = &self.settings;
            tracing::info!(
                topics = ?s.topics,
                pattern = ?s.topics_pattern,
                subscription = %s.subscription,
                "subscribing to input topics"
            );
            let consumer = self
                .client
                .subscribe(SubscribeOptions {
                    topics: s.topics.clone(),
                    topics_pattern: s.topics_pattern.clone(),
                    subscription: s.subscription.clone(),
                    subscription_type: s.subscription_type,
                    initial_position: s.initial_position,
                    ack_timeout: s.ack_timeout,
                    schema_types: s.schema_types.clone(),
                })
                .await?;

            if let Some(policy) = &s.dead_letter {
                let producer = self
                    .client
                    .create_producer(ProducerOptions::new(policy.topic.clone(), format!("{}-DLQ", s.subscription)))
                    .await
                    .map_err(|e| e.with_context("dead-letter producer"))?;
                self.dead_letter = Some((policy.max_redeliveries, producer));
            }
            self.consumer = Some(consumer);
            Ok(())
        })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Record>, PluginError>> {
        Box::pin(async move {
            let consumer = self
                .consumer
                .clone()
                .ok_or_else(|| PluginError::logic("source is not open"))?;
            loop {
                let message = consumer.receive().await?;
                if let Some((max, producer)) = &self.dead_letter {
                    if message.redelivery_count > *max {
                        self.send_to_dead_letter(producer.as_ref(), consumer.as_ref(), message).await?;
                        continue;
                    }
                }
                return Ok(Some(self.to_record(consumer.clone(), message)));
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            let mut first_err = None;
            if let Some(consumer) = self.consumer.take() {
                if let Err(e) = consumer.close().await {
                    first_err.get_or_insert(e);
                }
            }
            if let Some((_, producer)) = self.dead_letter.take() {
                if let Err(e) = producer.close().await {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use fnhost_api::record::RecordState;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::InstanceConfig;

    /// Context for driving sources and sinks outside an instance.
    pub(crate) struct NullContext {
        values: ConfigValues,
    }

    impl NullContext {
        pub(crate) fn new() -> Self {
            Self { values: ConfigValues::new() }
        }
    }

    impl Context for NullContext {
        fn tenant(&self) -> &str {
            "public"
        }
        fn namespace(&self) -> &str {
            "default"
        }
        fn function_name(&self) -> &str {
            "f"
        }
        fn function_id(&self) -> &str {
            "f"
        }
        fn function_version(&self) -> &str {
            ""
        }
        fn instance_id(&self) -> u32 {
            0
        }
        fn input_topics(&self) -> &[String] {
            &[]
        }
        fn output_topic(&self) -> Option<&str> {
            None
        }
        fn current_record(&self) -> Option<&Record> {
            None
        }
        fn user_config(&self) -> &ConfigValues {
            &self.values
        }
        fn secret(&self, _name: &str) -> Option<String> {
            None
        }
        fn log(&self, _level: fnhost_api::context::LogLevel, _message: &str) {}
        fn record_metric(&self, _name: &str, _value: f64) {}
        fn state(&self) -> Option<&dyn fnhost_api::state::StateStore> {
            None
        }
        fn publish<'a>(&'a self, _topic: &'a str, _value: Vec<u8>) -> BoxFuture<'a, Result<(), PluginError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn config(extra: &str) -> InstanceConfig {
        InstanceConfig::parse(&format!(
            r#"
            function_id = "f"
            [function]
            tenant = "public"
            namespace = "default"
            name = "f"
            [function.source]
            initial_position = "earliest"
            [function.source.inputs."in"]
            {extra}
            "#
        ))
        .unwrap()
    }

    async fn open_source(bus: &MemoryBus, settings: SourceSettings) -> MessagingSource {
        let mut source = MessagingSource::new(Arc::new(bus.clone()), settings);
        source.open(&ConfigValues::new(), &NullContext::new()).await.unwrap();
        source
    }

    #[test]
    fn settings_default_subscription_and_dead_letter_topic() {
        let mut cfg = config("");
        cfg.function.retry = Some(crate::config::RetryDetails {
            max_message_retries: 2,
            dead_letter_topic: None,
        });
        let settings = SourceSettings::from_config(&cfg);
        assert_eq!(settings.subscription, "public/default/f");
        assert_eq!(settings.topics, vec!["in".to_string()]);
        assert_eq!(
            settings.dead_letter,
            Some(DeadLetterPolicy {
                max_redeliveries: 2,
                topic: "in-public/default/f-DLQ".into()
            })
        );
    }

    #[test]
    fn regex_inputs_become_pattern() {
        let cfg = InstanceConfig::parse(
            r#"
            function_id = "f"
            [function]
            tenant = "t"
            namespace = "n"
            name = "f"
            [function.source.inputs."in-.*"]
            is_regex_pattern = true
            "#,
        )
        .unwrap();
        let settings = SourceSettings::from_config(&cfg);
        assert!(settings.topics.is_empty());
        assert_eq!(settings.topics_pattern.as_deref(), Some("in-.*"));
    }

    #[test]
    fn effectively_once_always_uses_failover() {
        let mut cfg = config("");
        cfg.function.processing_guarantees = ProcessingGuarantee::EffectivelyOnce;
        cfg.function.source.subscription_type = SubscriptionType::Shared;
        assert_eq!(SourceSettings::from_config(&cfg).subscription_type, SubscriptionType::Failover);

        cfg.function.processing_guarantees = ProcessingGuarantee::AtLeastOnce;
        assert_eq!(SourceSettings::from_config(&cfg).subscription_type, SubscriptionType::Shared);
    }

    #[tokio::test]
    async fn effectively_once_keeps_redelivery_on_one_instance() {
        let bus = MemoryBus::new();
        let mut cfg = config("");
        cfg.function.processing_guarantees = ProcessingGuarantee::EffectivelyOnce;
        let mut a = open_source(&bus, SourceSettings::from_config(&cfg)).await;
        let mut b = open_source(&bus, SourceSettings::from_config(&cfg)).await;
        for v in ["r0", "r1", "r2"] {
            bus.publish("in", v);
        }

        let r0 = a.read().await.unwrap().unwrap();
        r0.fail();
        let again = a.read().await.unwrap().unwrap();
        assert_eq!(again.message_id(), Some("in:0"));

        let standby = tokio::time::timeout(Duration::from_millis(50), b.read()).await;
        assert!(standby.is_err(), "standby consumer must not receive while the leader is attached");
    }

    #[tokio::test]
    async fn input_schema_is_declared_on_subscribe() {
        let bus = MemoryBus::new();
        let cfg = InstanceConfig::parse(
            r#"
            function_id = "f"
            [function]
            tenant = "public"
            namespace = "default"
            name = "f"
            [function.source.inputs."in"]
            schema_type = "json"
            "#,
        )
        .unwrap();
        let settings = SourceSettings::from_config(&cfg);
        assert_eq!(settings.schema_types.get("in").map(String::as_str), Some("json"));

        let _source = open_source(&bus, settings).await;
        assert_eq!(bus.schema_type("in").as_deref(), Some("json"));
    }

    #[tokio::test]
    async fn records_complete_against_the_bus() {
        let bus = MemoryBus::new();
        bus.publish("in", "a");
        let mut source = open_source(&bus, SourceSettings::from_config(&config(""))).await;

        let record = source.read().await.unwrap().unwrap();
        assert_eq!(record.value(), Some(&b"a"[..]));
        assert_eq!(record.topic(), Some("in"));
        assert_eq!(record.message_id(), Some("in:0"));
        assert_eq!(record.sequence_id(), Some(0));
        assert_eq!(bus.unacked_count("public/default/f"), 1);

        record.fail();
        let again = source.read().await.unwrap().unwrap();
        assert_eq!(again.message_id(), Some("in:0"));
        again.ack();
        assert_eq!(again.state(), RecordState::Acked);
        assert_eq!(bus.unacked_count("public/default/f"), 0);

        source.close().await.unwrap();
        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_records_go_to_dead_letter_topic() {
        let bus = MemoryBus::new();
        bus.publish("in", "poison");
        let mut settings = SourceSettings::from_config(&config(""));
        settings.dead_letter = Some(DeadLetterPolicy {
            max_redeliveries: 1,
            topic: "dlq".into(),
        });
        let mut source = open_source(&bus, settings).await;

        let first = source.read().await.unwrap().unwrap();
        assert_eq!(first.dead_letter_topic(), Some("dlq"));
        first.fail();
        let second = source.read().await.unwrap().unwrap();
        second.fail();

        bus.publish("in", "next");
        let next = source.read().await.unwrap().unwrap();
        assert_eq!(next.value(), Some(&b"next"[..]));
        assert_eq!(bus.values("dlq"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn read_before_open_is_an_error() {
        let bus = MemoryBus::new();
        let mut source = MessagingSource::new(Arc::new(bus), SourceSettings::from_config(&config("")));
        assert!(source.read().await.is_err());
    }
}
