use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;

use fnhost_api::BoxFuture;
use fnhost_api::config::ConfigValues;
use fnhost_api::context::{Context, LogLevel};
use fnhost_api::error::{FunctionError, PluginError};
use fnhost_api::function::{Function, PlainFunction, UserFunction};
use fnhost_api::record::{Record, RecordState};
use fnhost_api::sink::{Sink, SinkRecord};
use fnhost_api::source::Source;

use fnhost_engine::bus::MemoryBus;
use fnhost_engine::loader::StaticLoader;
use fnhost_engine::memory_store::MemoryStorage;
use fnhost_engine::secrets::ClearTextSecretsProvider;
use fnhost_engine::stats::{PROCESSED_SUCCESSFULLY_TOTAL, PROCESSED_TOTAL, USER_EXCEPTIONS_TOTAL};
use fnhost_engine::{FunctionInstance, InstanceConfig, InstanceDeps, InstanceError, InstanceHandle, InstanceState};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Upper;

impl PlainFunction for Upper {
    fn apply(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, FunctionError> {
        Ok(Some(input.to_ascii_uppercase()))
    }
}

#[derive(Clone)]
struct AlwaysFails;

impl PlainFunction for AlwaysFails {
    fn apply(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, FunctionError> {
        Err(format!("cannot handle {}", String::from_utf8_lossy(input)).into())
    }
}

/// Records, for each invocation, the completion state of the current record
/// and of the previous one.
struct Observer {
    previous: Option<Record>,
    seen: Arc<Mutex<Vec<(RecordState, Option<RecordState>)>>>,
}

impl Function for Observer {
    fn process<'a>(
        &'a mut self,
        _input: &'a [u8],
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>> {
        Box::pin(async move {
            let Some(current) = ctx.current_record() else {
                return Err("no current record".into());
            };
            let previous = self.previous.as_ref().map(Record::state);
            self.seen.lock().unwrap().push((current.state(), previous));
            self.previous = Some(current.clone());
            Ok(None)
        })
    }
}

/// Counts words in state and emits the running total.
struct Tally;

impl Function for Tally {
    fn process<'a>(
        &'a mut self,
        input: &'a [u8],
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>> {
        Box::pin(async move {
            let state = ctx.state().ok_or("state is not configured")?;
            state.incr_counter(input, 1).await?;
            let total = state.get_counter(input).await?;
            ctx.log(LogLevel::Info, &format!("{} seen {total} times", String::from_utf8_lossy(input)));
            ctx.record_metric("words", 1.0);
            Ok(Some(total.to_string().into_bytes()))
        })
    }
}

/// Sink that rejects one value and keeps everything else.
struct FlakySink {
    reject: Vec<u8>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Sink for FlakySink {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            if record.value == self.reject {
                return Err(PluginError::io("downstream rejected the write"));
            }
            self.written.lock().unwrap().push(record.value.clone());
            record.ack();
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Source that hands out a record without a value.
struct ValuelessSource;

impl Source for ValuelessSource {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Record>, PluginError>> {
        Box::pin(async { Ok(Some(Record::builder_without_value().message_id("broken:0").build())) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Sink that panics on one value and keeps everything else.
struct PanickingSink {
    poison: Vec<u8>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Sink for PanickingSink {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async move {
            if record.value == self.poison {
                panic!("sink cannot encode {}", String::from_utf8_lossy(&record.value));
            }
            self.written.lock().unwrap().push(record.value.clone());
            record.ack();
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Source whose reads panic.
struct PanickingSource;

impl PanickingSource {
    fn corrupted() -> Result<Option<Record>, PluginError> {
        panic!("connection state corrupted")
    }
}

impl Source for PanickingSource {
    fn open<'a>(&'a mut self, _config: &'a ConfigValues, _ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Record>, PluginError>> {
        Box::pin(async { Self::corrupted() })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Finishes an invocation only once the test adds a permit.
struct Gated {
    gate: Arc<tokio::sync::Semaphore>,
}

impl Function for Gated {
    fn process<'a>(
        &'a mut self,
        _input: &'a [u8],
        _ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>> {
        Box::pin(async move {
            self.gate.acquire().await?.forget();
            Ok(None)
        })
    }
}

fn config(class_name: &str, extra: &str) -> InstanceConfig {
    InstanceConfig::parse(&format!(
        r#"
        function_id = "fn-1"
        [function]
        tenant = "acme"
        namespace = "etl"
        name = "job"
        class_name = "{class_name}"
        {extra}
        "#
    ))
    .unwrap()
}

const PIPE: &str = r#"
    [function.source]
    initial_position = "earliest"
    [function.source.inputs."in"]
    [function.sink]
    topic = "out"
"#;

struct Harness {
    bus: MemoryBus,
    storage: MemoryStorage,
    loader: Arc<StaticLoader>,
}

impl Harness {
    fn new(loader: StaticLoader) -> Self {
        Self {
            bus: MemoryBus::new(),
            storage: MemoryStorage::new(),
            loader: Arc::new(loader),
        }
    }

    fn instance(&self, config: InstanceConfig, state_url: Option<&str>) -> FunctionInstance {
        let deps = InstanceDeps {
            loader: self.loader.clone(),
            package: String::new(),
            client: Arc::new(self.bus.clone()),
            storage: Arc::new(self.storage.clone()),
            state_storage_url: state_url.map(str::to_string),
            secrets: Arc::new(ClearTextSecretsProvider),
        };
        FunctionInstance::new(config, deps, &Registry::new()).unwrap()
    }
}

fn spawn(mut instance: FunctionInstance) -> (InstanceHandle, tokio::task::JoinHandle<Result<(), InstanceError>>) {
    let handle = instance.handle();
    let task = tokio::spawn(async move { instance.run().await });
    (handle, task)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn plain<F>(f: F) -> impl Fn(&ConfigValues) -> Result<UserFunction, PluginError> + Send + Sync + 'static
where
    F: PlainFunction + Clone + Sync + 'static,
{
    move |_| Ok(UserFunction::Plain(Box::new(f.clone())))
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transforms_records_and_acknowledges_them() {
    let h = Harness::new(StaticLoader::new().with_function("upper", vec![], plain(Upper)));
    let (handle, task) = spawn(h.instance(config("upper", PIPE), None));

    for word in ["a", "b", "c"] {
        h.bus.publish("in", word);
    }
    eventually("three outputs", || h.bus.values("out").len() == 3).await;
    assert_eq!(h.bus.values("out"), vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    eventually("all acknowledged", || h.bus.unacked_count("acme/etl/job") == 0).await;

    let status = handle.get_function_status();
    assert!(status.running);
    assert_eq!(status.num_received, 3);
    assert_eq!(status.num_processed, 3);
    assert_eq!(status.num_successfully_processed, 3);
    assert!(status.last_invocation_time > 0);
    assert!(status.failure_exception.is_none());

    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), InstanceState::Closed);
    assert_eq!(h.loader.instance_count("fn-1"), 0);
}

#[tokio::test]
async fn each_record_is_settled_before_the_next_one() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory_seen = seen.clone();
    let loader = StaticLoader::new().with_function("observer", vec![], move |_| {
        Ok(UserFunction::Contextual(Box::new(Observer {
            previous: None,
            seen: factory_seen.clone(),
        })))
    });
    let h = Harness::new(loader);
    let (handle, task) = spawn(h.instance(config("observer", PIPE), None));

    for i in 0..5 {
        h.bus.publish("in", format!("r{i}"));
    }
    eventually("five invocations", || seen.lock().unwrap().len() == 5).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0], (RecordState::Pending, None));
    for (current, previous) in &seen[1..] {
        assert_eq!(*current, RecordState::Pending);
        assert_eq!(*previous, Some(RecordState::Acked));
    }

    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn at_most_once_acknowledges_before_invocation() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory_seen = seen.clone();
    let loader = StaticLoader::new().with_function("observer", vec![], move |_| {
        Ok(UserFunction::Contextual(Box::new(Observer {
            previous: None,
            seen: factory_seen.clone(),
        })))
    });
    let h = Harness::new(loader);
    let extra = format!("processing_guarantees = \"at_most_once\"\n{PIPE}");
    let (handle, task) = spawn(h.instance(config("observer", &extra), None));

    h.bus.publish("in", "x");
    h.bus.publish("in", "y");
    eventually("two invocations", || seen.lock().unwrap().len() == 2).await;
    assert!(seen.lock().unwrap().iter().all(|(current, _)| *current == RecordState::Acked));

    handle.close();
    task.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

const PIPE_WITH_DLQ: &str = r#"
    [function.retry]
    max_message_retries = 0
    dead_letter_topic = "dlq"
    [function.source]
    initial_position = "earliest"
    [function.source.inputs."in"]
    [function.sink]
    topic = "out"
"#;

#[tokio::test]
async fn user_faults_are_counted_and_the_loop_keeps_running() {
    let h = Harness::new(StaticLoader::new().with_function("fails", vec![], plain(AlwaysFails)));
    let (handle, task) = spawn(h.instance(config("fails", PIPE_WITH_DLQ), None));

    const K: usize = 4;
    for i in 0..K {
        h.bus.publish("in", format!("r{i}"));
    }
    eventually("dead-lettered records", || h.bus.values("dlq").len() == K).await;

    let status = handle.get_function_status();
    assert_eq!(status.num_user_exceptions, K as u64);
    assert_eq!(status.num_system_exceptions, 0);
    assert_eq!(status.num_successfully_processed, 0);
    assert_eq!(status.latest_user_exceptions.len(), K);
    assert_eq!(status.latest_user_exceptions[0].message, "cannot handle r0");
    assert_eq!(handle.state(), InstanceState::Running);
    assert!(h.bus.values("out").is_empty());

    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sink_failure_only_affects_its_record() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink_written = written.clone();
    let loader = StaticLoader::new()
        .with_function("upper", vec![], plain(Upper))
        .with_sink("flaky", move |_| {
            Ok(Box::new(FlakySink {
                reject: b"TWO".to_vec(),
                written: sink_written.clone(),
            }) as Box<dyn Sink>)
        });
    let h = Harness::new(loader);
    let extra = PIPE_WITH_DLQ.replace("topic = \"out\"", "class_name = \"flaky\"");
    let (handle, task) = spawn(h.instance(config("upper", &extra), None));

    for word in ["one", "two", "three"] {
        h.bus.publish("in", word);
    }
    eventually("failed record dead-lettered", || h.bus.values("dlq").len() == 1).await;
    eventually("both neighbours written", || written.lock().unwrap().len() == 2).await;

    assert_eq!(*written.lock().unwrap(), vec![b"ONE".to_vec(), b"THREE".to_vec()]);
    assert_eq!(h.bus.values("dlq"), vec![b"two".to_vec()]);
    let stats = handle.stats();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.processed_successfully, 2);
    assert_eq!(stats.user_exceptions, 0);
    assert_eq!(handle.state(), InstanceState::Running);

    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sink_panic_only_affects_its_record() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink_written = written.clone();
    let loader = StaticLoader::new()
        .with_function("upper", vec![], plain(Upper))
        .with_sink("panicky", move |_| {
            Ok(Box::new(PanickingSink {
                poison: b"TWO".to_vec(),
                written: sink_written.clone(),
            }) as Box<dyn Sink>)
        });
    let h = Harness::new(loader);
    let extra = PIPE_WITH_DLQ.replace("topic = \"out\"", "class_name = \"panicky\"");
    let (handle, task) = spawn(h.instance(config("upper", &extra), None));

    for word in ["one", "two", "three"] {
        h.bus.publish("in", word);
    }
    eventually("failed record dead-lettered", || h.bus.values("dlq").len() == 1).await;
    eventually("both neighbours written", || written.lock().unwrap().len() == 2).await;

    assert_eq!(h.bus.values("dlq"), vec![b"two".to_vec()]);
    let status = handle.get_function_status();
    assert!(status.running);
    assert_eq!(status.num_processed, 3);
    assert_eq!(status.num_successfully_processed, 2);
    assert_eq!(status.num_system_exceptions, 0);
    assert!(handle.death_exception().is_none());

    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn source_panic_is_fatal_and_tears_down() {
    let loader = StaticLoader::new()
        .with_function("upper", vec![], plain(Upper))
        .with_source("panicky", |_| Ok(Box::new(PanickingSource) as Box<dyn Source>));
    let h = Harness::new(loader);
    let extra = "[function.source]\nclass_name = \"panicky\"";
    let (handle, task) = spawn(h.instance(config("upper", extra), Some("memory://state")));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, InstanceError::Panic(ref m) if m.contains("connection state corrupted")));
    assert_eq!(handle.death_exception(), Some(err.to_string()));

    let status = handle.get_function_status();
    assert!(!status.running);
    assert_eq!(status.num_system_exceptions, 1);
    assert_eq!(handle.state(), InstanceState::Closed);
    assert_eq!(h.loader.instance_count("fn-1"), 0);
    assert_eq!(h.storage.open_clients(), 0);
}

#[tokio::test]
async fn record_without_value_is_fatal() {
    let loader = StaticLoader::new()
        .with_function("upper", vec![], plain(Upper))
        .with_source("valueless", |_| Ok(Box::new(ValuelessSource) as Box<dyn Source>));
    let h = Harness::new(loader);
    let extra = "[function.source]\nclass_name = \"valueless\"";
    let (handle, task) = spawn(h.instance(config("upper", extra), None));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, InstanceError::IllegalInput(_)));
    assert_eq!(handle.death_exception(), Some(err.to_string()));

    let status = handle.get_function_status();
    assert!(!status.running);
    assert_eq!(status.num_received, 1);
    assert_eq!(status.num_processed, 0);
    assert_eq!(status.num_system_exceptions, 1);
    assert_eq!(handle.state(), InstanceState::Closed);
}

#[tokio::test]
async fn load_failure_is_fatal_and_releases_registration() {
    let h = Harness::new(StaticLoader::new());
    let (handle, task) = spawn(h.instance(config("missing", PIPE), None));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, InstanceError::Load { .. }));
    assert!(handle.death_exception().is_some_and(|m| m.contains("missing")));
    assert_eq!(h.loader.instance_count("fn-1"), 0);
}

#[tokio::test]
async fn unavailable_state_storage_is_fatal() {
    let h = Harness::new(StaticLoader::new().with_function("upper", vec![], plain(Upper)));
    h.storage.set_unavailable(true);
    let (handle, task) = spawn(h.instance(config("upper", PIPE), Some("memory://state")));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, InstanceError::State(_)));
    assert_eq!(handle.stats().system_exceptions, 1);
}

// ---------------------------------------------------------------------------
// State, logs and metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_counters_persist_across_instances() {
    let loader = StaticLoader::new().with_function("tally", vec![], |_| Ok(UserFunction::Contextual(Box::new(Tally))));
    let h = Harness::new(loader);
    let extra = format!("log_topic = \"logs\"\n{PIPE}");

    let (handle, task) = spawn(h.instance(config("tally", &extra), Some("memory://state")));
    h.bus.publish("in", "hello");
    h.bus.publish("in", "hello");
    eventually("two totals", || h.bus.values("out").len() == 2).await;
    assert_eq!(h.bus.values("out"), vec![b"1".to_vec(), b"2".to_vec()]);
    assert_eq!(h.storage.stream_ranges("acme_etl", "job"), Some(4));
    assert_eq!(handle.get_metrics().get("user_metric_words").map(|d| d.count), Some(2.0));
    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(h.storage.open_clients(), 0);

    eventually("log lines", || h.bus.values("logs").len() == 2).await;
    let line: serde_json::Value = serde_json::from_slice(&h.bus.values("logs")[1]).unwrap();
    assert_eq!(line["message"], "hello seen 2 times");
    assert_eq!(line["function"], "acme/etl/job");

    // Second instance against the already provisioned namespace and stream.
    let (handle, task) = spawn(h.instance(config("tally", &extra), Some("memory://state")));
    h.bus.publish("in", "hello");
    eventually("third total", || h.bus.values("out").len() == 3).await;
    assert_eq!(h.bus.values("out")[2], b"3".to_vec());
    assert_eq!(h.storage.namespace_creates(), 1);
    assert_eq!(h.storage.stream_creates(), 1);
    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn get_and_reset_leaves_an_empty_window() {
    let h = Harness::new(StaticLoader::new().with_function("fails", vec![], plain(AlwaysFails)));
    let (handle, task) = spawn(h.instance(config("fails", PIPE_WITH_DLQ), None));
    h.bus.publish("in", "x");
    eventually("dead-lettered", || h.bus.values("dlq").len() == 1).await;

    let taken = handle.get_and_reset_metrics();
    assert_eq!(taken.get(PROCESSED_TOTAL).map(|d| d.count), Some(1.0));
    assert_eq!(taken.get(USER_EXCEPTIONS_TOTAL).map(|d| d.count), Some(1.0));
    assert!(taken.get(PROCESSED_TOTAL).map(|d| d.count) >= taken.get(PROCESSED_SUCCESSFULLY_TOTAL).map(|d| d.count));

    let after = handle.get_metrics();
    assert_eq!(after.get(PROCESSED_TOTAL).map(|d| d.count), Some(0.0));
    assert_eq!(after.get(USER_EXCEPTIONS_TOTAL).map(|d| d.count), Some(0.0));
    let status = handle.get_function_status();
    assert!(status.latest_user_exceptions.is_empty());
    assert_eq!(status.average_latency_ms, 0.0);

    handle.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn invocation_in_flight_is_counted_in_the_window_it_completes_in() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let factory_gate = gate.clone();
    let loader = StaticLoader::new().with_function("gated", vec![], move |_| {
        Ok(UserFunction::Contextual(Box::new(Gated {
            gate: factory_gate.clone(),
        })))
    });
    let h = Harness::new(loader);
    let (handle, task) = spawn(h.instance(config("gated", PIPE), None));

    h.bus.publish("in", "x");
    eventually("record received", || handle.stats().received == 1).await;
    let before = handle.get_and_reset_metrics();
    assert_eq!(before.get(PROCESSED_TOTAL).map(|d| d.count), Some(0.0));

    gate.add_permits(1);
    eventually("record completed", || handle.stats().processed_successfully == 1).await;
    let after = handle.get_metrics();
    assert_eq!(after.get(PROCESSED_TOTAL).map(|d| d.count), Some(1.0));
    assert_eq!(after.get(PROCESSED_SUCCESSFULLY_TOTAL).map(|d| d.count), Some(1.0));

    handle.close();
    task.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_before_run_is_harmless() {
    let h = Harness::new(StaticLoader::new().with_function("upper", vec![], plain(Upper)));
    let mut instance = h.instance(config("upper", PIPE), None);
    let handle = instance.handle();

    handle.close();
    handle.close();
    instance.run().await.unwrap();
    instance.close().await;
    instance.close().await;

    assert_eq!(handle.state(), InstanceState::Closed);
    assert_eq!(h.loader.instance_count("fn-1"), 0);
    h.bus.publish("in", "late");
    assert!(h.bus.values("out").is_empty());
}

#[tokio::test]
async fn close_during_run_tears_down_once() {
    let h = Harness::new(StaticLoader::new().with_function("upper", vec![], plain(Upper)));
    let (handle, task) = spawn(h.instance(config("upper", PIPE), Some("memory://state")));
    h.bus.publish("in", "a");
    eventually("first output", || h.bus.values("out").len() == 1).await;

    handle.close();
    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), InstanceState::Closed);
    assert_eq!(h.storage.open_clients(), 0);
    assert_eq!(h.storage.open_admins(), 0);
}
