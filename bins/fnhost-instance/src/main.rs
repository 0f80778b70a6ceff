use std::sync::Arc;

use clap::{Parser, ValueEnum};
use prometheus::Registry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use fnhost_engine::bus::MemoryBus;
use fnhost_engine::loader::SharedLibraryCache;
use fnhost_engine::memory_store::MemoryStorage;
use fnhost_engine::messaging::{Consumer, MessagingClient, SubscribeOptions};
use fnhost_engine::secrets::{ClearTextSecretsProvider, EnvironmentSecretsProvider, SecretsProvider};
use fnhost_engine::{FunctionInstance, InstanceConfig, InstanceDeps};

#[derive(Clone, Copy, ValueEnum)]
enum SecretsKind {
    /// Secret paths name environment variables.
    Env,
    /// Secret paths are the secret values.
    ClearText,
}

#[derive(Parser)]
#[command(name = "fnhost-instance", about = "Run one function instance against an in-process bus")]
struct Cli {
    /// Path to TOML instance configuration.
    #[arg(long, default_value = "instance.toml", env = "FNHOST_CONFIG")]
    config: String,

    /// Function package (shared library) to load.
    #[arg(long, env = "FNHOST_LIBRARY")]
    library: String,

    /// Enables the state table. Any non-empty value selects the in-memory store.
    #[arg(long, env = "FNHOST_STATE_STORAGE_URL")]
    state_storage_url: Option<String>,

    /// Serve the monitoring API on this port.
    #[arg(long, env = "FNHOST_MONITOR_PORT")]
    monitor_port: Option<u16>,

    #[arg(long, value_enum, default_value = "env", env = "FNHOST_SECRETS")]
    secrets: SecretsKind,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match InstanceConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    let input_topic = config.function.source.inputs.keys().next().cloned();
    let output_topic = config.function.sink.topic().map(str::to_string);

    let bus = MemoryBus::new();
    let registry = Registry::new();
    let secrets: Arc<dyn SecretsProvider> = match cli.secrets {
        SecretsKind::Env => Arc::new(EnvironmentSecretsProvider),
        SecretsKind::ClearText => Arc::new(ClearTextSecretsProvider),
    };
    let deps = InstanceDeps {
        loader: Arc::new(SharedLibraryCache::new()),
        package: cli.library.clone(),
        client: Arc::new(bus.clone()),
        storage: Arc::new(MemoryStorage::new()),
        state_storage_url: cli.state_storage_url.clone(),
        secrets,
    };

    let mut instance = match FunctionInstance::new(config, deps, &registry) {
        Ok(i) => i,
        Err(e) => {
            tracing::error!(error = %e, "failed to create instance");
            std::process::exit(1);
        }
    };
    let handle = instance.handle();
    let shutdown = CancellationToken::new();

    if let Some(topic) = output_topic {
        match bus
            .subscribe(SubscribeOptions::topics([topic.as_str()], "fnhost-instance-tail"))
            .await
        {
            Ok(consumer) => {
                tokio::spawn(tail_output(consumer, shutdown.clone()));
            }
            Err(e) => tracing::warn!(topic = %topic, error = %e, "cannot follow output topic"),
        }
    }

    let mut run = tokio::spawn(async move { instance.run().await });

    if let Some(port) = cli.monitor_port {
        let monitor = handle.clone();
        let registry = registry.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = fnhost_monitor::run(port, monitor, registry, token).await {
                tracing::error!(error = %e, "monitoring server failed");
            }
        });
    }

    match input_topic {
        Some(topic) => {
            tokio::spawn(pipe_stdin(bus.clone(), topic, shutdown.clone()));
        }
        None => tracing::info!("no input topic configured, stdin is ignored"),
    }

    tracing::info!(instance = %handle.name(), "fnhost-instance started, press Ctrl+C to stop");

    let finished = tokio::select! {
        res = &mut run => Some(res),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down...");
            None
        }
    };

    let result = match finished {
        Some(res) => res,
        None => {
            handle.close();
            run.await
        }
    };
    shutdown.cancel();

    match result {
        Ok(Ok(())) => tracing::info!("instance stopped"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "instance failed");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "instance task aborted");
            std::process::exit(1);
        }
    }
}

/// Publish every stdin line to `topic`.
async fn pipe_stdin(bus: MemoryBus, topic: String, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let id = bus.publish(&topic, line);
                tracing::debug!(message_id = %id, "published input");
            }
            Ok(None) => {
                tracing::info!("stdin closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                return;
            }
        }
    }
}

async fn tail_output(consumer: Arc<dyn Consumer>, shutdown: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = consumer.receive() => message,
        };
        match message {
            Ok(message) => {
                tracing::info!(
                    message_id = %message.id,
                    value = %String::from_utf8_lossy(&message.value),
                    "output"
                );
                if let Err(e) = consumer.ack(&message.id) {
                    tracing::warn!(error = %e, "failed to ack output");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "output tail stopped");
                break;
            }
        }
    }
    if let Err(e) = consumer.close().await {
        tracing::warn!(error = %e, "failed to close output tail");
    }
}
