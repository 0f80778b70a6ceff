//! Function instance runtime.
//!
//! [`FunctionInstance`] owns the user callable, the source, the sink and the
//! state table, and drives the read → invoke → route cycle on whichever task
//! calls [`FunctionInstance::run`]. [`InstanceHandle`] is the cloneable side
//! used concurrently by monitoring and control: metrics, status, the death
//! exception, and `close()`.
//!
//! State machine:
//!
//! ```text
//! Created → Loading → Running → Closing → Closed
//!              │          │
//!              └──────────┴──→ Failed → Closed
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::FutureExt;
use prometheus::Registry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use fnhost_api::BoxFuture;
use fnhost_api::config::ConfigValues;
use fnhost_api::context::Context;
use fnhost_api::error::PluginError;
use fnhost_api::function::UserFunction;
use fnhost_api::record::Record;
use fnhost_api::sink::{Sink, SinkRecord};
use fnhost_api::source::Source;

use crate::config::{InstanceConfig, ProcessingGuarantee};
use crate::context::{ContextImpl, InvocationContext};
use crate::error::InstanceError;
use crate::loader::FunctionLoader;
use crate::log_forwarder::LogForwarder;
use crate::messaging::MessagingClient;
use crate::secrets::SecretsProvider;
use crate::sink::{DisabledSink, MessagingSink};
use crate::source::{MessagingSource, SourceSettings};
use crate::state::{setup_state_table, StateTable, StorageConnector};
use crate::stats::{
    now_ms, ExceptionInfo, FunctionStats, MetricsData, MetricsLabels, StatsSnapshot, UserMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Loading,
    Running,
    Closing,
    Failed,
    Closed,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InstanceState::Created,
            1 => InstanceState::Loading,
            2 => InstanceState::Running,
            3 => InstanceState::Closing,
            4 => InstanceState::Failed,
            _ => InstanceState::Closed,
        }
    }
}

/// Outcome of one invocation. User faults are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// `None` means the function produced no output for this input.
    Output(Option<Vec<u8>>),
    UserFault(String),
}

/// Point-in-time health and throughput of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionStatus {
    pub running: bool,
    pub state: InstanceState,
    pub failure_exception: Option<String>,
    pub instance_id: u32,
    pub num_received: u64,
    pub num_processed: u64,
    pub num_successfully_processed: u64,
    pub num_user_exceptions: u64,
    pub num_system_exceptions: u64,
    pub latest_user_exceptions: Vec<ExceptionInfo>,
    pub latest_system_exceptions: Vec<ExceptionInfo>,
    pub average_latency_ms: f64,
    pub last_invocation_time: i64,
}

struct Shared {
    name: String,
    instance_id: u32,
    state: AtomicU8,
    death: OnceLock<String>,
    stats: FunctionStats,
    user_metrics: Arc<UserMetrics>,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state as u8, Ordering::Release);
        tracing::debug!(instance = %self.name, ?state, "instance state changed");
    }
}

/// Monitoring and control handle of an instance. Cheap to clone, safe to use
/// from any task while the instance runs.
#[derive(Clone)]
pub struct InstanceHandle {
    shared: Arc<Shared>,
}

impl InstanceHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> InstanceState {
        self.shared.state()
    }

    /// Message of the fatal error that stopped the instance, if any.
    pub fn death_exception(&self) -> Option<String> {
        self.shared.death.get().cloned()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn get_metrics(&self) -> MetricsData {
        MetricsData::from_parts(&self.shared.stats.snapshot(), self.shared.user_metrics.snapshot())
    }

    pub fn get_and_reset_metrics(&self) -> MetricsData {
        let stats = self.shared.stats.snapshot_and_reset();
        MetricsData::from_parts(&stats, self.shared.user_metrics.take())
    }

    pub fn reset_metrics(&self) {
        self.shared.stats.reset();
        self.shared.user_metrics.reset();
    }

    pub fn get_function_status(&self) -> FunctionStatus {
        let stats = self.shared.stats.snapshot();
        let state = self.state();
        FunctionStatus {
            running: state == InstanceState::Running,
            state,
            failure_exception: self.death_exception(),
            instance_id: self.shared.instance_id,
            num_received: stats.received,
            num_processed: stats.processed,
            num_successfully_processed: stats.processed_successfully,
            num_user_exceptions: stats.user_exceptions,
            num_system_exceptions: stats.system_exceptions,
            average_latency_ms: stats.latency.mean_ms(),
            last_invocation_time: stats.last_invocation_ms,
            latest_user_exceptions: stats.latest_user_exceptions,
            latest_system_exceptions: stats.latest_system_exceptions,
        }
    }

    /// Ask the instance to stop. Idempotent; the running loop finishes the
    /// record in flight (if any) and tears down.
    pub fn close(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::info!(instance = %self.shared.name, "close requested");
        }
        self.shared.cancel.cancel();
    }
}

/// Everything opened during `Loading`, released during teardown.
struct Runtime {
    function: UserFunction,
    source: Box<dyn Source>,
    sink: Box<dyn Sink>,
    context: Arc<ContextImpl>,
}

/// Collaborators an instance is built from.
pub struct InstanceDeps {
    pub loader: Arc<dyn FunctionLoader>,
    /// Code identifier handed to the loader (library path, or ignored by
    /// in-process loaders).
    pub package: String,
    pub client: Arc<dyn MessagingClient>,
    pub storage: Arc<dyn StorageConnector>,
    pub state_storage_url: Option<String>,
    pub secrets: Arc<dyn SecretsProvider>,
}

pub struct FunctionInstance {
    config: Arc<InstanceConfig>,
    deps: InstanceDeps,
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    state_table: Option<StateTable>,
    log_forwarder: Option<Arc<LogForwarder>>,
    registered: bool,
    torn_down: bool,
}

impl FunctionInstance {
    /// Build an instance and register its metrics in `registry`.
    pub fn new(config: InstanceConfig, deps: InstanceDeps, registry: &Registry) -> Result<Self, InstanceError> {
        let details = &config.function;
        let labels = MetricsLabels {
            tenant: details.tenant.clone(),
            namespace: format!("{}/{}", details.tenant, details.namespace),
            name: details.fully_qualified_name(),
            instance_id: config.instance_id.to_string(),
            cluster: config.cluster_name.clone(),
        };
        let stats = FunctionStats::new(registry, &labels)?;

        let shared = Arc::new(Shared {
            name: config.instance_name(),
            instance_id: config.instance_id,
            state: AtomicU8::new(InstanceState::Created as u8),
            death: OnceLock::new(),
            stats,
            user_metrics: Arc::new(UserMetrics::default()),
            cancel: CancellationToken::new(),
        });

        Ok(Self {
            config: Arc::new(config),
            deps,
            shared,
            runtime: None,
            state_table: None,
            log_forwarder: None,
            registered: false,
            torn_down: false,
        })
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Load, then process records until closed or a fatal error occurs.
    /// Teardown always runs before returning. The returned error is the
    /// death exception.
    pub async fn run(&mut self) -> Result<(), InstanceError> {
        if self.shared.state() != InstanceState::Created {
            return Err(InstanceError::Config(format!("instance {} was already started", self.shared.name)));
        }
        if self.shared.cancel.is_cancelled() {
            self.close().await;
            return Ok(());
        }

        let span = tracing::info_span!("instance", name = %self.shared.name);
        let cycle = async {
            self.shared.set_state(InstanceState::Loading);
            self.load().await?;
            self.shared.set_state(InstanceState::Running);
            tracing::info!(guarantee = ?self.config.function.processing_guarantees, "instance running");
            self.process_loop().await
        }
        .instrument(span);
        let outcome = match AssertUnwindSafe(cycle).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(InstanceError::Panic(panic_message(panic.as_ref()))),
        };

        if let Err(e) = &outcome {
            self.record_death(e);
        }
        self.close().await;
        outcome
    }

    fn record_death(&self, e: &InstanceError) {
        let message = e.to_string();
        tracing::error!(instance = %self.shared.name, error = %message, "instance failed");
        self.shared.stats.add_system_exception(message.clone());
        let _ = self.shared.death.set(message);
        self.shared.set_state(InstanceState::Failed);
    }

    async fn load(&mut self) -> Result<(), InstanceError> {
        let config = self.config.clone();
        let details = &config.function;
        let function_id = &config.function_id;
        let instance = self.shared.name.clone();

        self.deps.loader.register(function_id, &instance, &self.deps.package)?;
        self.registered = true;

        let loaded = self
            .deps
            .loader
            .load_function(function_id, &details.class_name, details.user_config.as_ref())?;
        tracing::info!(class = %details.class_name, shape = loaded.object.shape(), "function loaded");

        let state_table = setup_state_table(
            self.deps.storage.as_ref(),
            self.deps.state_storage_url.as_deref(),
            details,
        )
        .await?;
        let state_store = state_table.as_ref().map(StateTable::store);
        self.state_table = state_table;

        if let Some(topic) = details.log_topic() {
            let forwarder = LogForwarder::start(
                self.deps.client.as_ref(),
                topic,
                &details.fully_qualified_name(),
                config.instance_id,
                config.max_buffered_tuples,
            )
            .await?;
            self.log_forwarder = Some(forwarder);
        }

        let context = Arc::new(ContextImpl::new(
            &config,
            loaded.config,
            self.deps.secrets.clone(),
            state_store,
            self.shared.user_metrics.clone(),
            self.deps.client.clone(),
            self.log_forwarder.clone(),
        ));

        let (sink, sink_config) = self.build_sink(&config)?;
        let (source, source_config) = self.build_source(&config)?;

        // Stored before opening so teardown closes whatever did open.
        let rt = self.runtime.insert(Runtime {
            function: loaded.object,
            source,
            sink,
            context,
        });
        rt.sink
            .open(&sink_config, rt.context.as_ref())
            .await
            .map_err(|e| InstanceError::Plugin(e.with_context("sink open")))?;
        rt.source
            .open(&source_config, rt.context.as_ref())
            .await
            .map_err(|e| InstanceError::Plugin(e.with_context("source open")))?;
        Ok(())
    }

    fn build_sink(&self, config: &InstanceConfig) -> Result<(Box<dyn Sink>, ConfigValues), InstanceError> {
        let details = &config.function;
        let spec = &details.sink;
        if !spec.class_name.is_empty() {
            let loaded = self
                .deps
                .loader
                .load_sink(&config.function_id, &spec.class_name, spec.configs.as_ref())?;
            return Ok((loaded.object, loaded.config));
        }
        let sink: Box<dyn Sink> = match spec.topic() {
            Some(topic) => Box::new(
                MessagingSink::new(
                    self.deps.client.clone(),
                    topic,
                    details.processing_guarantees,
                    config.instance_name(),
                )
                .with_schema_type(spec.schema_type.clone()),
            ),
            None => Box::new(DisabledSink::new(details.auto_ack)),
        };
        Ok((sink, ConfigValues::new()))
    }

    fn build_source(&self, config: &InstanceConfig) -> Result<(Box<dyn Source>, ConfigValues), InstanceError> {
        let spec = &config.function.source;
        if !spec.class_name.is_empty() {
            let loaded = self
                .deps
                .loader
                .load_source(&config.function_id, &spec.class_name, spec.configs.as_ref())?;
            return Ok((loaded.object, loaded.config));
        }
        let source = MessagingSource::new(self.deps.client.clone(), SourceSettings::from_config(config));
        Ok((Box::new(source), ConfigValues::new()))
    }

    async fn process_loop(&mut self) -> Result<(), InstanceError> {
        let details = &self.config.function;
        let guarantee = details.processing_guarantees;
        let auto_ack = details.auto_ack;
        let shared = self.shared.clone();
        let forwarder = self.log_forwarder.clone();
        let Some(rt) = self.runtime.as_mut() else {
            return Err(InstanceError::Config("instance is not loaded".into()));
        };

        loop {
            let read = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Ok(()),
                read = rt.source.read() => read,
            };
            let record = read
                .map_err(InstanceError::Source)?
                .ok_or_else(|| InstanceError::IllegalInput("source returned no record".into()))?;
            shared.stats.incr_received();

            let Some(input) = record.value() else {
                return Err(InstanceError::IllegalInput(format!(
                    "record {} has no value",
                    record.message_id().unwrap_or("<unknown>")
                )));
            };

            if guarantee == ProcessingGuarantee::AtMostOnce && auto_ack {
                record.ack();
            }

            let span = tracing::info_span!(
                "invoke",
                topic = record.topic().unwrap_or_default(),
                message_id = record.message_id().unwrap_or_default(),
            );
            shared.stats.set_last_invocation(now_ms());
            let started = Instant::now();
            let result = {
                let _attached = forwarder.as_ref().map(|f| f.attach());
                let ctx = InvocationContext::new(&rt.context, &record);
                invoke(&mut rt.function, input, &ctx).instrument(span).await
            };
            shared.stats.incr_processed();
            shared.stats.record_latency(started.elapsed());

            process_result(result, &record, rt.sink.as_mut(), &shared.stats, auto_ack).await;
        }
    }

    /// Release everything the instance opened. Idempotent; safe before
    /// `run()` and after it returned. Each step is attempted regardless of
    /// earlier failures.
    pub async fn close(&mut self) {
        self.shared.cancel.cancel();
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if self.shared.state() != InstanceState::Failed {
            self.shared.set_state(InstanceState::Closing);
        }

        if let Some(mut rt) = self.runtime.take() {
            close_quietly(&self.shared.name, "source", rt.source.close()).await;
            close_quietly(&self.shared.name, "sink", rt.sink.close()).await;
            let closed = std::panic::catch_unwind(AssertUnwindSafe(|| rt.function.close()));
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(instance = %self.shared.name, error = %e, "failed to close function"),
                Err(_) => tracing::warn!(instance = %self.shared.name, "function panicked while closing"),
            }
            rt.context.close().await;
        }

        if let Some(table) = self.state_table.take() {
            table.close().await;
        }

        if let Some(forwarder) = self.log_forwarder.take() {
            forwarder.close().await;
        }

        if self.registered {
            self.registered = false;
            self.deps
                .loader
                .unregister(&self.config.function_id, &self.shared.name);
        }

        self.shared.stats.unregister();
        self.shared.set_state(InstanceState::Closed);
        tracing::info!(instance = %self.shared.name, "instance closed");
    }
}

/// Call the user callable. Errors and panics both become user faults.
async fn invoke(function: &mut UserFunction, input: &[u8], ctx: &dyn Context) -> ExecutionResult {
    match AssertUnwindSafe(function.invoke(input, ctx)).catch_unwind().await {
        Ok(Ok(output)) => ExecutionResult::Output(output),
        Ok(Err(e)) => ExecutionResult::UserFault(e.to_string()),
        Err(panic) => ExecutionResult::UserFault(format!("panic: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

async fn close_quietly(instance: &str, what: &str, closing: BoxFuture<'_, Result<(), PluginError>>) {
    match AssertUnwindSafe(closing).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(instance, error = %e, "failed to close {what}"),
        Err(panic) => tracing::warn!(instance, panic = %panic_message(panic.as_ref()), "{what} panicked while closing"),
    }
}

/// Route one invocation outcome. Never fatal: a failed or panicking write
/// fails the record and the loop moves on.
async fn process_result(
    result: ExecutionResult,
    record: &Record,
    sink: &mut dyn Sink,
    stats: &FunctionStats,
    auto_ack: bool,
) {
    match result {
        ExecutionResult::UserFault(message) => {
            tracing::warn!(message_id = ?record.message_id(), error = %message, "function raised an error");
            stats.add_user_exception(message);
            record.fail();
        }
        ExecutionResult::Output(Some(value)) => {
            let write = async { sink.write(SinkRecord::new(record.clone(), value)).await };
            let written = match AssertUnwindSafe(write).catch_unwind().await {
                Ok(written) => written,
                Err(panic) => Err(PluginError::logic(format!("sink panicked: {}", panic_message(panic.as_ref())))),
            };
            match written {
                Ok(()) => stats.incr_processed_successfully(),
                Err(e) => {
                    let e = InstanceError::SinkWrite(e);
                    tracing::warn!(message_id = ?record.message_id(), error = %e, "record failed");
                    record.fail();
                }
            }
        }
        ExecutionResult::Output(None) => {
            if auto_ack {
                record.ack();
            }
            stats.incr_processed_successfully();
        }
    }
}
