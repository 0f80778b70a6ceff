use fnhost_api::error::PluginError;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("config error: {0}")]
    Config(String),

    /// The source broke its contract (no record, or a record without value).
    #[error("illegal input: {0}")]
    IllegalInput(String),

    #[error("failed to load '{what}': {message}")]
    Load { what: String, message: String },

    #[error("state storage error: {0}")]
    State(#[from] StorageError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("source read failed: {0}")]
    Source(PluginError),

    #[error("sink write failed: {0}")]
    SinkWrite(PluginError),

    /// A source, sink or loader panicked outside the user function.
    #[error("panic: {0}")]
    Panic(String),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstanceError {
    pub fn load(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        InstanceError::Load {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Add context to the error.
    ///
    /// For `Plugin` variant, context is added to the inner `PluginError`.
    /// For message-carrying variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            InstanceError::Plugin(e) => InstanceError::Plugin(e.with_context(ctx)),
            InstanceError::Config(msg) => InstanceError::Config(format!("{ctx}: {msg}")),
            InstanceError::IllegalInput(msg) => InstanceError::IllegalInput(format!("{ctx}: {msg}")),
            InstanceError::Load { what, message } => InstanceError::Load {
                what,
                message: format!("{ctx}: {message}"),
            },
            other => other,
        }
    }
}

/// Errors reported by the state storage collaborator.
///
/// The not-found / already-exists variants are distinct so that table
/// provisioning can be idempotent without inspecting messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("stream '{namespace}/{stream}' not found")]
    StreamNotFound { namespace: String, stream: String },

    #[error("namespace '{0}' already exists")]
    NamespaceExists(String),

    #[error("stream '{namespace}/{stream}' already exists")]
    StreamExists { namespace: String, stream: String },

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("{0} is closed")]
    Closed(String),
}

impl From<StorageError> for PluginError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Closed(_) => PluginError::closed(e.to_string()),
            other => PluginError::state(other.to_string()),
        }
    }
}
