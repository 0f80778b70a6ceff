use crate::BoxFuture;
use crate::config::ConfigValues;
use crate::context::Context;
use crate::error::PluginError;
use crate::record::Record;

/// Input side of an instance.
///
/// The instance owns the source exclusively and calls it from a single task:
/// `open` once, then `read` until shutdown, then `close` once.
pub trait Source: Send {
    /// Called once before the first `read()`.
    fn open<'a>(
        &'a mut self,
        config: &'a ConfigValues,
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<(), PluginError>>;

    /// Wait for the next record. May suspend indefinitely.
    ///
    /// `Ok(None)` or a record without a value is a contract violation and
    /// terminates the instance.
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Record>, PluginError>>;

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>>;
}
