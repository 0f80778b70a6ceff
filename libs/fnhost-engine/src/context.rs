//! The context user code sees.
//!
//! [`ContextImpl`] lives as long as the instance and is what sources and sinks
//! receive on `open`. Each invocation wraps it in an [`InvocationContext`]
//! carrying the record being processed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fnhost_api::BoxFuture;
use fnhost_api::config::ConfigValues;
use fnhost_api::context::{Context, LogLevel};
use fnhost_api::error::PluginError;
use fnhost_api::record::Record;
use fnhost_api::state::StateStore;

use crate::config::InstanceConfig;
use crate::log_forwarder::LogForwarder;
use crate::messaging::{MessagingClient, OutgoingMessage, Producer, ProducerOptions};
use crate::secrets::{self, SecretsProvider};
use crate::state::StateContextImpl;
use crate::stats::UserMetrics;

pub struct ContextImpl {
    tenant: String,
    namespace: String,
    name: String,
    function_id: String,
    function_version: String,
    instance_id: u32,
    input_topics: Vec<String>,
    output_topic: Option<String>,
    user_config: ConfigValues,
    secrets: BTreeMap<String, String>,
    secrets_provider: Arc<dyn SecretsProvider>,
    state: Option<StateContextImpl>,
    user_metrics: Arc<UserMetrics>,
    client: Arc<dyn MessagingClient>,
    producers: tokio::sync::Mutex<HashMap<String, Arc<dyn Producer>>>,
    log_forwarder: Option<Arc<LogForwarder>>,
}

impl ContextImpl {
    pub fn new(
        config: &InstanceConfig,
        user_config: ConfigValues,
        secrets_provider: Arc<dyn SecretsProvider>,
        state: Option<StateContextImpl>,
        user_metrics: Arc<UserMetrics>,
        client: Arc<dyn MessagingClient>,
        log_forwarder: Option<Arc<LogForwarder>>,
    ) -> Self {
        let details = &config.function;
        let mut input_topics: Vec<String> = details.source.inputs.keys().cloned().collect();
        if let Some(pattern) = &details.source.topics_pattern {
            input_topics.push(pattern.clone());
        }
        Self {
            tenant: details.tenant.clone(),
            namespace: details.namespace.clone(),
            name: details.name.clone(),
            function_id: config.function_id.clone(),
            function_version: config.function_version.clone(),
            instance_id: config.instance_id,
            input_topics,
            output_topic: details.sink.topic().map(str::to_string),
            user_config,
            secrets: details.secrets.clone(),
            secrets_provider,
            state,
            user_metrics,
            client,
            producers: tokio::sync::Mutex::new(HashMap::new()),
            log_forwarder,
        }
    }

    async fn producer(&self, topic: &str) -> Result<Arc<dyn Producer>, PluginError> {
        let mut producers = self.producers.lock().await;
        if let Some(p) = producers.get(topic) {
            return Ok(p.clone());
        }
        let producer = self
            .client
            .create_producer(ProducerOptions::new(
                topic,
                format!("{}:{}:publish", self.fully_qualified_name(), self.instance_id),
            ))
            .await?;
        producers.insert(topic.to_string(), producer.clone());
        Ok(producer)
    }

    /// Close producers opened through `publish`.
    pub async fn close(&self) {
        let producers: Vec<_> = self.producers.lock().await.drain().collect();
        for (topic, producer) in producers {
            if let Err(e) = producer.close().await {
                tracing::warn!(topic = %topic, error = %e, "failed to close publish producer");
            }
        }
    }
}

impl Context for ContextImpl {
    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn function_name(&self) -> &str {
        &self.name
    }

    fn function_id(&self) -> &str {
        &self.function_id
    }

    fn function_version(&self) -> &str {
        &self.function_version
    }

    fn instance_id(&self) -> u32 {
        self.instance_id
    }

    fn input_topics(&self) -> &[String] {
        &self.input_topics
    }

    fn output_topic(&self) -> Option<&str> {
        self.output_topic.as_deref()
    }

    fn current_record(&self) -> Option<&Record> {
        None
    }

    fn user_config(&self) -> &ConfigValues {
        &self.user_config
    }

    fn secret(&self, name: &str) -> Option<String> {
        secrets::resolve(self.secrets_provider.as_ref(), &self.secrets, name)
    }

    fn log(&self, level: LogLevel, message: &str) {
        let function = &self.name;
        match level {
            LogLevel::Trace => tracing::trace!(function = %function, "{message}"),
            LogLevel::Debug => tracing::debug!(function = %function, "{message}"),
            LogLevel::Info => tracing::info!(function = %function, "{message}"),
            LogLevel::Warn => tracing::warn!(function = %function, "{message}"),
            LogLevel::Error => tracing::error!(function = %function, "{message}"),
        }
        if let Some(forwarder) = &self.log_forwarder {
            forwarder.forward(level, message);
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.user_metrics.record(name, value);
    }

    fn state(&self) -> Option<&dyn StateStore> {
        self.state.as_ref().map(|s| s as &dyn StateStore)
    }

    fn publish<'a>(&'a self, topic: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            let producer = self.producer(topic).await?;
            producer.send(OutgoingMessage::new(value)).await?;
            Ok(())
        })
    }
}

/// Context of one invocation: the instance context plus the current record.
pub struct InvocationContext<'a> {
    base: &'a ContextImpl,
    record: &'a Record,
}

impl<'a> InvocationContext<'a> {
    pub fn new(base: &'a ContextImpl, record: &'a Record) -> Self {
        Self { base, record }
    }
}

impl Context for InvocationContext<'_> {
    fn tenant(&self) -> &str {
        self.base.tenant()
    }

    fn namespace(&self) -> &str {
        self.base.namespace()
    }

    fn function_name(&self) -> &str {
        self.base.function_name()
    }

    fn function_id(&self) -> &str {
        self.base.function_id()
    }

    fn function_version(&self) -> &str {
        self.base.function_version()
    }

    fn instance_id(&self) -> u32 {
        self.base.instance_id()
    }

    fn input_topics(&self) -> &[String] {
        self.base.input_topics()
    }

    fn output_topic(&self) -> Option<&str> {
        self.base.output_topic()
    }

    fn current_record(&self) -> Option<&Record> {
        Some(self.record)
    }

    fn user_config(&self) -> &ConfigValues {
        self.base.user_config()
    }

    fn secret(&self, name: &str) -> Option<String> {
        self.base.secret(name)
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.base.log(level, message)
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.base.record_metric(name, value)
    }

    fn state(&self) -> Option<&dyn StateStore> {
        self.base.state()
    }

    fn publish<'b>(&'b self, topic: &'b str, value: Vec<u8>) -> BoxFuture<'b, Result<(), PluginError>> {
        self.base.publish(topic, value)
    }
}
