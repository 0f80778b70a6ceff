//! In-memory state storage.
//!
//! Implements the storage collaborator traits against process memory. Used by
//! the local runner and by tests, which also read its provisioning counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fnhost_api::BoxFuture;

use crate::error::StorageError;
use crate::state::{StorageAdmin, StorageClient, StorageConnector, StreamConfig, Table};
use crate::sync::lock;

#[derive(Default)]
struct TableData {
    values: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    counters: Mutex<HashMap<Vec<u8>, i64>>,
}

struct Stream {
    config: StreamConfig,
    data: Arc<TableData>,
}

#[derive(Default)]
struct StorageInner {
    /// namespace → stream → data
    namespaces: Mutex<HashMap<String, HashMap<String, Stream>>>,
    namespace_creates: AtomicUsize,
    stream_creates: AtomicUsize,
    open_admins: AtomicUsize,
    open_clients: AtomicUsize,
    unavailable: AtomicBool,
}

impl StorageInner {
    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StorageError::Unavailable("storage is unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<StorageInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent connection attempt fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Namespaces created through an admin connection.
    pub fn namespace_creates(&self) -> usize {
        self.inner.namespace_creates.load(Ordering::Acquire)
    }

    /// Streams created through an admin connection.
    pub fn stream_creates(&self) -> usize {
        self.inner.stream_creates.load(Ordering::Acquire)
    }

    pub fn open_admins(&self) -> usize {
        self.inner.open_admins.load(Ordering::Acquire)
    }

    pub fn open_clients(&self) -> usize {
        self.inner.open_clients.load(Ordering::Acquire)
    }

    pub fn stream_ranges(&self, namespace: &str, stream: &str) -> Option<u32> {
        lock(&self.inner.namespaces)
            .get(namespace)
            .and_then(|streams| streams.get(stream))
            .map(|s| s.config.initial_ranges)
    }

    /// Create a namespace without going through an admin connection.
    pub fn create_namespace_directly(&self, namespace: &str) {
        lock(&self.inner.namespaces).entry(namespace.to_string()).or_default();
    }
}

impl StorageConnector for MemoryStorage {
    fn connect_admin<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Box<dyn StorageAdmin>, StorageError>> {
        Box::pin(async move {
            self.inner.check_available()?;
            self.inner.open_admins.fetch_add(1, Ordering::AcqRel);
            Ok(Box::new(MemoryAdmin {
                storage: self.inner.clone(),
                closed: AtomicBool::new(false),
            }) as Box<dyn StorageAdmin>)
        })
    }

    fn connect_client<'a>(
        &'a self,
        _url: &'a str,
        _namespace: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn StorageClient>, StorageError>> {
        Box::pin(async move {
            self.inner.check_available()?;
            self.inner.open_clients.fetch_add(1, Ordering::AcqRel);
            Ok(Arc::new(MemoryClient {
                storage: self.inner.clone(),
                closed: Arc::new(AtomicBool::new(false)),
            }) as Arc<dyn StorageClient>)
        })
    }
}

struct MemoryAdmin {
    storage: Arc<StorageInner>,
    closed: AtomicBool,
}

impl MemoryAdmin {
    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("admin client".into()));
        }
        self.storage.check_available()
    }
}

impl StorageAdmin for MemoryAdmin {
    fn get_stream<'a>(&'a self, namespace: &'a str, stream: &'a str) -> BoxFuture<'a, Result<StreamConfig, StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            let namespaces = lock(&self.storage.namespaces);
            let streams = namespaces
                .get(namespace)
                .ok_or_else(|| StorageError::NamespaceNotFound(namespace.to_string()))?;
            streams
                .get(stream)
                .map(|s| s.config)
                .ok_or_else(|| StorageError::StreamNotFound {
                    namespace: namespace.to_string(),
                    stream: stream.to_string(),
                })
        })
    }

    fn create_namespace<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            let mut namespaces = lock(&self.storage.namespaces);
            if namespaces.contains_key(namespace) {
                return Err(StorageError::NamespaceExists(namespace.to_string()));
            }
            namespaces.insert(namespace.to_string(), HashMap::new());
            self.storage.namespace_creates.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn create_stream<'a>(
        &'a self,
        namespace: &'a str,
        stream: &'a str,
        config: StreamConfig,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            let mut namespaces = lock(&self.storage.namespaces);
            let streams = namespaces
                .get_mut(namespace)
                .ok_or_else(|| StorageError::NamespaceNotFound(namespace.to_string()))?;
            if streams.contains_key(stream) {
                return Err(StorageError::StreamExists {
                    namespace: namespace.to_string(),
                    stream: stream.to_string(),
                });
            }
            streams.insert(
                stream.to_string(),
                Stream {
                    config,
                    data: Arc::default(),
                },
            );
            self.storage.stream_creates.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.storage.open_admins.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(())
        })
    }
}

struct MemoryClient {
    storage: Arc<StorageInner>,
    closed: Arc<AtomicBool>,
}

impl StorageClient for MemoryClient {
    fn open_table<'a>(&'a self, namespace: &'a str, table: &'a str) -> BoxFuture<'a, Result<Arc<dyn Table>, StorageError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(StorageError::Closed("storage client".into()));
            }
            let data = lock(&self.storage.namespaces)
                .get(namespace)
                .and_then(|streams| streams.get(table))
                .map(|s| s.data.clone())
                .ok_or_else(|| StorageError::TableNotFound(format!("{namespace}/{table}")))?;
            Ok(Arc::new(MemoryTable {
                name: table.to_string(),
                data,
                closed: AtomicBool::new(false),
                client_closed: self.closed.clone(),
            }) as Arc<dyn Table>)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.storage.open_clients.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(())
        })
    }
}

struct MemoryTable {
    name: String,
    data: Arc<TableData>,
    closed: AtomicBool,
    client_closed: Arc<AtomicBool>,
}

impl MemoryTable {
    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) || self.client_closed.load(Ordering::Acquire) {
            Err(StorageError::Closed(format!("table '{}'", self.name)))
        } else {
            Ok(())
        }
    }
}

impl Table for MemoryTable {
    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            Ok(lock(&self.data.values).get(key).cloned())
        })
    }

    fn put<'a>(&'a self, key: &'a [u8], value: Vec<u8>) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            lock(&self.data.values).insert(key.to_vec(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            lock(&self.data.values).remove(key);
            Ok(())
        })
    }

    fn incr<'a>(&'a self, key: &'a [u8], amount: i64) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            *lock(&self.data.counters).entry(key.to_vec()).or_insert(0) += amount;
            Ok(())
        })
    }

    fn get_counter<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<i64, StorageError>> {
        Box::pin(async move {
            self.check_open()?;
            Ok(lock(&self.data.counters).get(key).copied().unwrap_or(0))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}
