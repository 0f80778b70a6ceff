//! State table lifecycle.
//!
//! A function's state lives in a remote table named after the function,
//! inside a storage namespace derived from its tenant and namespace. The table
//! is provisioned lazily through a short-lived admin connection, then opened
//! once through a long-lived client that stays with the instance until
//! teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fnhost_api::BoxFuture;
use fnhost_api::error::PluginError;
use fnhost_api::state::StateStore;

use crate::config::FunctionDetails;
use crate::error::StorageError;

/// Initial number of key ranges of a newly created state stream.
pub const INITIAL_STREAM_RANGES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub initial_ranges: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_ranges: INITIAL_STREAM_RANGES,
        }
    }
}

/// Administrative connection to the storage cluster.
pub trait StorageAdmin: Send + Sync {
    /// Fails with `NamespaceNotFound` or `StreamNotFound` when missing.
    fn get_stream<'a>(&'a self, namespace: &'a str, stream: &'a str) -> BoxFuture<'a, Result<StreamConfig, StorageError>>;

    /// Fails with `NamespaceExists` when already present.
    fn create_namespace<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Fails with `StreamExists` when already present.
    fn create_stream<'a>(
        &'a self,
        namespace: &'a str,
        stream: &'a str,
        config: StreamConfig,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Data-path connection used to open tables.
pub trait StorageClient: Send + Sync {
    fn open_table<'a>(&'a self, namespace: &'a str, table: &'a str) -> BoxFuture<'a, Result<Arc<dyn Table>, StorageError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Byte-keyed table handle.
pub trait Table: Send + Sync {
    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>>;

    fn put<'a>(&'a self, key: &'a [u8], value: Vec<u8>) -> BoxFuture<'a, Result<(), StorageError>>;

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>>;

    fn incr<'a>(&'a self, key: &'a [u8], amount: i64) -> BoxFuture<'a, Result<(), StorageError>>;

    fn get_counter<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<i64, StorageError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Turns a state storage URL into connections.
pub trait StorageConnector: Send + Sync {
    fn connect_admin<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn StorageAdmin>, StorageError>>;

    fn connect_client<'a>(
        &'a self,
        url: &'a str,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn StorageClient>, StorageError>>;
}

/// Storage namespace of a function: `tenant_namespace` with dashes replaced.
pub fn state_namespace(details: &FunctionDetails) -> String {
    format!("{}_{}", details.tenant, details.namespace).replace('-', "_")
}

/// An opened state table together with the client that owns it.
pub struct StateTable {
    namespace: String,
    name: String,
    client: Arc<dyn StorageClient>,
    table: Arc<dyn Table>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTable")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

impl StateTable {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Narrow key/value view handed to user code.
    pub fn store(&self) -> StateContextImpl {
        StateContextImpl {
            table: self.table.clone(),
        }
    }

    /// Close the table, then its client. Safe to call more than once; each
    /// step is attempted even if the previous one failed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.table.close().await {
            tracing::warn!(table = %self.name, error = %e, "failed to close state table");
        }
        if let Err(e) = self.client.close().await {
            tracing::warn!(namespace = %self.namespace, error = %e, "failed to close state storage client");
        }
    }
}

/// Provision (if needed) and open the state table of a function.
///
/// Returns `Ok(None)` when no storage URL is configured. Running it again
/// against an already provisioned namespace and stream is a no-op apart
/// from opening a new handle.
pub async fn setup_state_table(
    connector: &dyn StorageConnector,
    url: Option<&str>,
    details: &FunctionDetails,
) -> Result<Option<StateTable>, StorageError> {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let namespace = state_namespace(details);
    let name = details.name.clone();

    tracing::info!(url, namespace = %namespace, table = %name, "setting up state table");

    let admin = connector.connect_admin(url).await?;
    let provisioned = provision(admin.as_ref(), &namespace, &name).await;
    if let Err(e) = admin.close().await {
        tracing::warn!(error = %e, "failed to close state storage admin client");
    }
    provisioned?;

    let client = connector.connect_client(url, &namespace).await?;
    let table = match client.open_table(&namespace, &name).await {
        Ok(table) => table,
        Err(e) => {
            if let Err(close_err) = client.close().await {
                tracing::warn!(error = %close_err, "failed to close state storage client");
            }
            return Err(e);
        }
    };

    Ok(Some(StateTable {
        namespace,
        name,
        client,
        table,
        closed: AtomicBool::new(false),
    }))
}

async fn provision(admin: &dyn StorageAdmin, namespace: &str, stream: &str) -> Result<(), StorageError> {
    match admin.get_stream(namespace, stream).await {
        Ok(_) => return Ok(()),
        Err(StorageError::NamespaceNotFound(_)) => {
            tracing::info!(namespace, "creating state namespace");
            match admin.create_namespace(namespace).await {
                Ok(()) | Err(StorageError::NamespaceExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::StreamNotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    tracing::info!(namespace, stream, "creating state stream");
    match admin.create_stream(namespace, stream, StreamConfig::default()).await {
        Ok(()) | Err(StorageError::StreamExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// State view handed to user code through its context.
#[derive(Clone)]
pub struct StateContextImpl {
    table: Arc<dyn Table>,
}

impl StateStore for StateContextImpl {
    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Vec<u8>>, PluginError>> {
        Box::pin(async move { Ok(self.table.get(key).await?) })
    }

    fn put<'a>(&'a self, key: &'a [u8], value: Vec<u8>) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move { Ok(self.table.put(key, value).await?) })
    }

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move { Ok(self.table.delete(key).await?) })
    }

    fn incr_counter<'a>(&'a self, key: &'a [u8], amount: i64) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move { Ok(self.table.incr(key, amount).await?) })
    }

    fn get_counter<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<i64, PluginError>> {
        Box::pin(async move { Ok(self.table.get_counter(key).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::memory_store::MemoryStorage;

    fn details() -> FunctionDetails {
        InstanceConfig::parse(
            r#"
            function_id = "f"
            [function]
            tenant = "acme"
            namespace = "etl-jobs"
            name = "counter"
            [function.source.inputs."in"]
            "#,
        )
        .unwrap()
        .function
    }

    #[tokio::test]
    async fn no_url_means_no_table() {
        let storage = MemoryStorage::new();
        assert!(setup_state_table(&storage, None, &details()).await.unwrap().is_none());
        assert!(setup_state_table(&storage, Some(""), &details()).await.unwrap().is_none());
        assert_eq!(storage.namespace_creates(), 0);
    }

    #[tokio::test]
    async fn provisions_namespace_and_stream_once() {
        let storage = MemoryStorage::new();
        let d = details();

        let first = setup_state_table(&storage, Some("mem://"), &d).await.unwrap().unwrap();
        assert_eq!(first.namespace(), "acme_etl_jobs");
        assert_eq!(first.name(), "counter");
        assert_eq!(storage.stream_ranges("acme_etl_jobs", "counter"), Some(INITIAL_STREAM_RANGES));

        let second = setup_state_table(&storage, Some("mem://"), &d).await.unwrap().unwrap();
        assert_eq!(storage.namespace_creates(), 1);
        assert_eq!(storage.stream_creates(), 1);

        first.close().await;
        second.close().await;
        assert_eq!(storage.open_clients(), 0);
        assert_eq!(storage.open_admins(), 0);
    }

    #[tokio::test]
    async fn existing_namespace_only_creates_stream() {
        let storage = MemoryStorage::new();
        storage.create_namespace_directly("acme_etl_jobs");
        setup_state_table(&storage, Some("mem://"), &details()).await.unwrap();
        assert_eq!(storage.namespace_creates(), 0);
        assert_eq!(storage.stream_creates(), 1);
    }

    #[tokio::test]
    async fn unavailable_storage_is_an_error() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);
        let Err(err) = setup_state_table(&storage, Some("mem://"), &details()).await else {
            panic!("state table set up against unavailable storage");
        };
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn close_twice_releases_once() {
        let storage = MemoryStorage::new();
        let table = setup_state_table(&storage, Some("mem://"), &details()).await.unwrap().unwrap();
        assert_eq!(storage.open_clients(), 1);
        table.close().await;
        table.close().await;
        assert_eq!(storage.open_clients(), 0);
    }

    #[tokio::test]
    async fn store_maps_table_operations() {
        let storage = MemoryStorage::new();
        let table = setup_state_table(&storage, Some("mem://"), &details()).await.unwrap().unwrap();
        let store = table.store();

        store.put(b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);

        store.incr_counter(b"c", 2).await.unwrap();
        store.incr_counter(b"c", 3).await.unwrap();
        assert_eq!(store.get_counter(b"c").await.unwrap(), 5);

        table.close().await;
        let err = store.get(b"k").await.unwrap_err();
        assert_eq!(err.kind, fnhost_api::error::ErrorKind::Closed);
    }
}
