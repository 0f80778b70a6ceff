use crate::BoxFuture;
use crate::config::ConfigValues;
use crate::context::Context;
use crate::error::PluginError;
use crate::record::Record;

/// Function output paired with the input record that produced it.
///
/// The sink completes `source` once the output is durable (or drops it on
/// failure and lets the instance fail the record).
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub source: Record,
    pub value: Vec<u8>,
}

impl SinkRecord {
    pub fn new(source: Record, value: Vec<u8>) -> Self {
        Self { source, value }
    }

    pub fn ack(&self) -> bool {
        self.source.ack()
    }

    pub fn fail(&self) -> bool {
        self.source.fail()
    }
}

/// Output side of an instance.
pub trait Sink: Send {
    /// Called once before the first `write()`.
    fn open<'a>(
        &'a mut self,
        config: &'a ConfigValues,
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<(), PluginError>>;

    /// Forward one output. An error fails this record only.
    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>>;

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>>;
}
