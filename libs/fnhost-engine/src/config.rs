use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::InstanceError;

/// Instance configuration, parsed from TOML and immutable after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub instance_id: u32,

    pub function_id: String,

    #[serde(default)]
    pub function_version: String,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Bound of in-process buffers (log forwarding queue).
    #[serde(default = "default_max_buffered_tuples")]
    pub max_buffered_tuples: usize,

    pub function: FunctionDetails,
}

fn default_cluster_name() -> String {
    "standalone".to_string()
}

fn default_max_buffered_tuples() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDetails {
    pub tenant: String,
    pub namespace: String,
    pub name: String,

    /// Identifier the code loader resolves to the user callable.
    #[serde(default)]
    pub class_name: String,

    /// Topic receiving function-authored log lines. Empty disables forwarding.
    #[serde(default)]
    pub log_topic: Option<String>,

    #[serde(default)]
    pub processing_guarantees: ProcessingGuarantee,

    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,

    /// Free-form user config handed to the function through its context.
    #[serde(default)]
    pub user_config: Option<serde_json::Value>,

    /// Secret name → provider-specific path.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    #[serde(default)]
    pub source: SourceSpec,

    #[serde(default)]
    pub sink: SinkSpec,

    #[serde(default)]
    pub retry: Option<RetryDetails>,

    #[serde(default)]
    pub resources: Resources,
}

fn default_auto_ack() -> bool {
    true
}

impl FunctionDetails {
    /// `tenant/namespace/name`.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.namespace, self.name)
    }

    pub fn log_topic(&self) -> Option<&str> {
        self.log_topic.as_deref().filter(|t| !t.is_empty())
    }
}

/// When a record is acknowledged relative to the invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingGuarantee {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    EffectivelyOnce,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Records are spread across all consumers of the subscription.
    #[default]
    Shared,
    /// One active consumer; the next takes over when it goes away.
    Failover,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    Latest,
    Earliest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsumerSpec {
    #[serde(default)]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub is_regex_pattern: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceSpec {
    /// Custom source identifier. Empty selects the messaging source.
    #[serde(default)]
    pub class_name: String,

    #[serde(default)]
    pub configs: Option<serde_json::Value>,

    /// Input topic → consumer settings.
    #[serde(default)]
    pub inputs: BTreeMap<String, ConsumerSpec>,

    #[serde(default)]
    pub topics_pattern: Option<String>,

    /// Defaults to the function's fully qualified name.
    #[serde(default)]
    pub subscription_name: Option<String>,

    #[serde(default)]
    pub subscription_type: SubscriptionType,

    #[serde(default)]
    pub initial_position: InitialPosition,

    /// Redeliver records not acknowledged within this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkSpec {
    /// Custom sink identifier. Empty selects the messaging sink.
    #[serde(default)]
    pub class_name: String,

    #[serde(default)]
    pub configs: Option<serde_json::Value>,

    /// Output topic. Empty (with no custom sink) disables output.
    #[serde(default)]
    pub topic: Option<String>,

    #[serde(default)]
    pub schema_type: Option<String>,
}

impl SinkSpec {
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryDetails {
    pub max_message_retries: u32,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub ram_bytes: Option<u64>,
    #[serde(default)]
    pub disk_bytes: Option<u64>,
}

impl InstanceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, InstanceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InstanceError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, InstanceError> {
        let config: InstanceConfig =
            toml::from_str(toml_str).map_err(|e| InstanceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), InstanceError> {
        let details = &self.function;
        for (field, value) in [
            ("tenant", &details.tenant),
            ("namespace", &details.namespace),
            ("name", &details.name),
        ] {
            if value.is_empty() {
                return Err(InstanceError::Config(format!("function.{field} must not be empty")));
            }
        }
        let source = &details.source;
        if source.class_name.is_empty() && source.inputs.is_empty() && source.topics_pattern.is_none() {
            return Err(InstanceError::Config(
                "function.source needs inputs, a topics_pattern or a class_name".into(),
            ));
        }
        Ok(())
    }

    /// Name of this instance: `fqfn:instance_id`.
    pub fn instance_name(&self) -> String {
        format!("{}:{}", self.function.fully_qualified_name(), self.instance_id)
    }
}
