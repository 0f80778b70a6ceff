//! Default sinks: publish to the output topic, or discard.

use std::collections::HashMap;
use std::sync::Arc;

use fnhost_api::BoxFuture;
use fnhost_api::config::ConfigValues;
use fnhost_api::context::Context;
use fnhost_api::error::PluginError;
use fnhost_api::sink::{Sink, SinkRecord};

use crate::config::ProcessingGuarantee;
use crate::messaging::{MessagingClient, OutgoingMessage, Producer, ProducerOptions, SendOutcome};

/// Publishes function output to one topic.
///
/// The source record is acknowledged once the publish went through, except
/// under at-most-once where it was already settled before the invocation.
/// Under effectively-once every input topic gets its own producer and the
/// source record's sequence id travels with the output, so republishing the
/// output of a redelivered record is dropped by the bus.
pub struct MessagingSink {
    client: Arc<dyn MessagingClient>,
    topic: String,
    guarantee: ProcessingGuarantee,
    producer_name: String,
    schema_type: Option<String>,
    producer: Option<Arc<dyn Producer>>,
    /// Input topic → producer, effectively-once only.
    per_input: HashMap<String, Arc<dyn Producer>>,
}

impl MessagingSink {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        topic: impl Into<String>,
        guarantee: ProcessingGuarantee,
        producer_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            topic: topic.into(),
            guarantee,
            producer_name: producer_name.into(),
            schema_type: None,
            producer: None,
            per_input: HashMap::new(),
        }
    }

    pub fn with_schema_type(mut self, schema_type: Option<String>) -> Self {
        self.schema_type = schema_type.filter(|s| !s.is_empty());
        self
    }

    fn options(&self, producer_name: String) -> ProducerOptions {
        ProducerOptions {
            topic: self.topic.clone(),
            producer_name,
            schema_type: self.schema_type.clone(),
        }
    }

    async fn producer_for(&mut self, input_topic: Option<&str>) -> Result<Arc<dyn Producer>, PluginError> {
        if self.guarantee != ProcessingGuarantee::EffectivelyOnce {
            return self
                .producer
                .clone()
                .ok_or_else(|| PluginError::logic("sink is not open"));
        }

        let input = input_topic.unwrap_or_default().to_string();
        if let Some(p) = self.per_input.get(&input) {
            return Ok(p.clone());
        }
        let producer = self
            .client
            .create_producer(self.options(format!("{}-{input}", self.producer_name)))
            .await?;
        self.per_input.insert(input, producer.clone());
        Ok(producer)
    }
}

impl Sink for MessagingSink {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            if self.guarantee != ProcessingGuarantee::EffectivelyOnce {
                let producer = self
                    .client
                    .create_producer(self.options(self.producer_name.clone()))
                    .await?;
                self.producer = Some(producer);
            }
            tracing::info!(topic = %self.topic, guarantee = ?self.guarantee, "output sink open");
            Ok(())
        })
    }

    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            let source = &record.source;
            let producer = self.producer_for(source.topic()).await?;

            let message = OutgoingMessage {
                value: record.value.clone(),
                key: source.key().map(str::to_string),
                properties: source.properties().clone(),
                event_time_ms: source.event_time_ms(),
                sequence_id: match self.guarantee {
                    ProcessingGuarantee::EffectivelyOnce => source.sequence_id(),
                    _ => None,
                },
            };

            match producer.send(message).await? {
                SendOutcome::Published(_) => {}
                SendOutcome::Duplicate => {
                    tracing::debug!(message = ?source.message_id(), "output already published, skipping");
                }
            }
            if self.guarantee != ProcessingGuarantee::AtMostOnce {
                record.ack();
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            let mut first_err = None;
            let producers = self.producer.take().into_iter().chain(self.per_input.drain().map(|(_, p)| p));
            for producer in producers.collect::<Vec<_>>() {
                if let Err(e) = producer.close().await {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

/// Sink used when the function has no output topic: output is discarded and
/// the source record settled as if the function returned nothing.
pub struct DisabledSink {
    ack_discarded: bool,
}

impl DisabledSink {
    pub fn new(auto_ack: bool) -> Self {
        Self {
            ack_discarded: auto_ack,
        }
    }
}

impl Sink for DisabledSink {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            if self.ack_discarded {
                record.ack();
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}
