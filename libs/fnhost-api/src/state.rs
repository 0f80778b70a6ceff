use crate::BoxFuture;
use crate::error::PluginError;

/// Key/value state scoped to one function, as seen by user code.
///
/// Backed by a remote table owned by the instance. User code never sees the
/// table handle or the storage client behind it.
pub trait StateStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Vec<u8>>, PluginError>>;

    fn put<'a>(&'a self, key: &'a [u8], value: Vec<u8>) -> BoxFuture<'a, Result<(), PluginError>>;

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), PluginError>>;

    /// Add `amount` to the counter stored under `key` (missing counts as 0).
    fn incr_counter<'a>(&'a self, key: &'a [u8], amount: i64) -> BoxFuture<'a, Result<(), PluginError>>;

    fn get_counter<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<i64, PluginError>>;
}
