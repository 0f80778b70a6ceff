use std::fmt;

use crate::BoxFuture;
use crate::config::ConfigValues;
use crate::error::PluginError;
use crate::record::Record;
use crate::state::StateStore;

/// Severity of a function-authored log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a function (and a custom source or sink) may ask of the
/// instance hosting it.
///
/// During an invocation the function receives a per-invocation context:
/// `current_record()` is set and `log()` reaches the log topic if one is
/// configured. Outside an invocation `current_record()` is `None`.
pub trait Context: Send + Sync {
    fn tenant(&self) -> &str;

    fn namespace(&self) -> &str;

    fn function_name(&self) -> &str;

    fn function_id(&self) -> &str;

    fn function_version(&self) -> &str;

    fn instance_id(&self) -> u32;

    /// `tenant/namespace/name`.
    fn fully_qualified_name(&self) -> String {
        format!("{}/{}/{}", self.tenant(), self.namespace(), self.function_name())
    }

    fn input_topics(&self) -> &[String];

    fn output_topic(&self) -> Option<&str>;

    /// Record being processed, if called during an invocation.
    fn current_record(&self) -> Option<&Record>;

    fn user_config(&self) -> &ConfigValues;

    /// Resolve a secret declared in the function's secrets map.
    fn secret(&self, name: &str) -> Option<String>;

    fn log(&self, level: LogLevel, message: &str);

    /// Record a user-defined metric sample.
    fn record_metric(&self, name: &str, value: f64);

    /// Function-scoped state, if the instance has a state store configured.
    fn state(&self) -> Option<&dyn StateStore>;

    /// Publish `value` to an arbitrary topic.
    fn publish<'a>(&'a self, topic: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), PluginError>>;
}
