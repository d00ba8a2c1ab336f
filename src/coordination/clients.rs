//! Process-wide registry of store handles, keyed by logical store name.
//!
//! Handles are connected lazily on first lookup and shared afterwards, so
//! every caller asking for `"default"` talks through the same pool.  Nothing
//! here is global: the registry is an ordinary value the application builds
//! once and passes around (or tears down with [`StoreRegistry::close`]).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{Config, LockConfig, StoreConfig};
use crate::coordination::locks::AcquireOptions;
use crate::coordination::redis::KeyDbStore;
use crate::coordination::semaphore::{self, SemaphoreMode};
use crate::coordination::store::CoordinationStore;
use crate::error::{validate_key, CoordinationError, Result};
use crate::metrics::{Metrics, MetricsRegistry};

/// A value read back from the store through a [`StoreHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Text(String),
    Binary(Vec<u8>),
}

impl StoredValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// A ready-to-use connection to one logical store.  Cheap to clone.
#[derive(Clone)]
pub struct StoreHandle {
    name: Arc<str>,
    store: Arc<dyn CoordinationStore>,
    decode_responses: bool,
    metrics: Arc<Metrics>,
}

impl StoreHandle {
    pub fn new(
        name: impl Into<Arc<str>>,
        store: Arc<dyn CoordinationStore>,
        decode_responses: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            decode_responses,
            metrics,
        }
    }

    /// Wrap `store` with a private metrics registry.  Handy for tests and
    /// one-off tools.
    pub fn standalone(name: impl Into<Arc<str>>, store: Arc<dyn CoordinationStore>) -> Self {
        Self::new(name, store, true, MetricsRegistry::new().metrics)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn decode_responses(&self) -> bool {
        self.decode_responses
    }

    /// The same store, read back with a different decode flag.
    pub fn with_decode_responses(mut self, decode_responses: bool) -> Self {
        self.decode_responses = decode_responses;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Read `key`, decoding it as UTF-8 text if this handle decodes
    /// responses.
    pub async fn get_value(&self, key: &str) -> Result<Option<StoredValue>> {
        validate_key(key)?;
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        if !self.decode_responses {
            return Ok(Some(StoredValue::Binary(raw)));
        }
        String::from_utf8(raw)
            .map(|s| Some(StoredValue::Text(s)))
            .map_err(|_| CoordinationError::Decode {
                key: key.to_string(),
            })
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("decode_responses", &self.decode_responses)
            .finish_non_exhaustive()
    }
}

/// One slot per store name, filled by the first successful connect.
type HandleSlot = Arc<OnceCell<StoreHandle>>;

/// Lazily-connected handles for every configured store.
pub struct StoreRegistry {
    configs: BTreeMap<String, StoreConfig>,
    handles: Mutex<HashMap<String, HandleSlot>>,
    semaphore_mode: SemaphoreMode,
    locks: LockConfig,
    metrics: MetricsRegistry,
}

impl StoreRegistry {
    /// Record the connection parameters of every configured store.  Nothing
    /// is connected until [`get_interface`](Self::get_interface) asks for it.
    pub fn from_config(config: &Config) -> Self {
        Self {
            configs: config.stores.clone(),
            handles: Mutex::new(HashMap::new()),
            semaphore_mode: config.semaphores.mode,
            locks: config.locks.clone(),
            metrics: MetricsRegistry::new(),
        }
    }

    /// A registry with no configured stores; populate it with
    /// [`register`](Self::register).
    pub fn empty() -> Self {
        Self {
            configs: BTreeMap::new(),
            handles: Mutex::new(HashMap::new()),
            semaphore_mode: SemaphoreMode::default(),
            locks: LockConfig::default(),
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn with_semaphore_mode(mut self, mode: SemaphoreMode) -> Self {
        self.semaphore_mode = mode;
        self
    }

    pub fn semaphore_mode(&self) -> SemaphoreMode {
        self.semaphore_mode
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Acquisition options built from the `locks` config section.
    pub fn acquire_options(&self) -> AcquireOptions {
        let mut options = AcquireOptions::default().retry_interval(self.locks.retry_interval());
        if let Some(timeout) = self.locks.acquire_timeout() {
            options = options.timeout(timeout);
        }
        options
    }

    /// Install a pre-built store under `name`, replacing any cached handle.
    pub async fn register(
        &self,
        name: &str,
        store: Arc<dyn CoordinationStore>,
        decode_responses: bool,
    ) -> StoreHandle {
        let handle = StoreHandle::new(
            name,
            store,
            decode_responses,
            Arc::clone(&self.metrics.metrics),
        );
        let slot = Arc::new(OnceCell::new_with(Some(handle.clone())));
        self.handles.lock().await.insert(name.to_string(), slot);
        debug!(store = name, "store registered");
        handle
    }

    /// Return the handle for the store called `name`, connecting it first if
    /// this is the first lookup.
    ///
    /// Fails with [`CoordinationError::UnknownStore`] if `name` is neither
    /// configured nor registered.  Concurrent first lookups of one name share
    /// a single connect; lookups of other names do not wait for it.
    pub async fn get_interface(&self, name: &str) -> Result<StoreHandle> {
        let slot = {
            let mut handles = self.handles.lock().await;
            match handles.get(name) {
                Some(slot) => Arc::clone(slot),
                None => {
                    if !self.configs.contains_key(name) {
                        return Err(CoordinationError::UnknownStore {
                            name: name.to_string(),
                        });
                    }
                    let slot = HandleSlot::default();
                    handles.insert(name.to_string(), Arc::clone(&slot));
                    slot
                }
            }
        };

        let handle = slot.get_or_try_init(|| self.connect(name)).await?;
        Ok(handle.clone())
    }

    /// Like [`get_interface`](Self::get_interface), but with the decode flag
    /// chosen by the caller instead of the store's config.  Both flavours
    /// share one pool.
    pub async fn get_interface_with(
        &self,
        name: &str,
        decode_responses: bool,
    ) -> Result<StoreHandle> {
        let handle = self.get_interface(name).await?;
        Ok(handle.with_decode_responses(decode_responses))
    }

    async fn connect(&self, name: &str) -> Result<StoreHandle> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| CoordinationError::UnknownStore {
                name: name.to_string(),
            })?;

        let store = KeyDbStore::connect(name, config).await?;
        info!(store = name, "store connected");
        Ok(StoreHandle::new(
            name,
            Arc::new(store),
            config.decode_responses,
            Arc::clone(&self.metrics.metrics),
        ))
    }

    /// Every configured or registered store name, sorted.
    pub async fn names(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        self.configs
            .keys()
            .chain(handles.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Claim a semaphore on the store called `name`, in the configured mode.
    pub async fn create_semaphore(&self, name: &str, key: &str, ttl: Duration) -> Result<bool> {
        let handle = self.get_interface(name).await?;
        semaphore::create_semaphore(&handle, key, ttl, self.semaphore_mode).await
    }

    /// Delete a semaphore on the store called `name`.
    pub async fn delete_semaphore(&self, name: &str, key: &str) -> Result<()> {
        let handle = self.get_interface(name).await?;
        semaphore::delete_semaphore(&handle, key).await
    }

    /// Close every connected store and forget the handles.  Lookups after
    /// this reconnect configured stores from scratch.
    pub async fn close(&self) {
        let drained: Vec<(String, HandleSlot)> = self.handles.lock().await.drain().collect();
        for (name, slot) in drained {
            let Some(handle) = slot.get() else { continue };
            if let Err(e) = handle.store.close().await {
                warn!(store = %name, error = %e, "failed to close store");
            }
        }
        debug!("store registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;

    #[tokio::test]
    async fn unknown_store_is_a_config_error() {
        let registry = StoreRegistry::empty();
        let err = registry.get_interface("missing").await.unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownStore { ref name } if name == "missing"));
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn repeated_lookups_share_the_store() {
        let registry = StoreRegistry::empty();
        let store = MemoryStore::new();
        registry.register("default", store.clone(), true).await;

        let a = registry.get_interface("default").await.unwrap();
        let b = registry.get_interface("default").await.unwrap();
        assert!(Arc::ptr_eq(a.store(), b.store()));
        assert_eq!(a.name(), "default");
    }

    #[tokio::test]
    async fn decode_flag_controls_value_shape() {
        let registry = StoreRegistry::empty();
        let store = MemoryStore::new();
        let text = registry.register("text", store.clone(), true).await;
        let binary = registry.register("binary", store.clone(), false).await;

        store
            .set_with_ttl("k", b"hello", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            text.get_value("k").await.unwrap(),
            Some(StoredValue::Text("hello".to_string()))
        );
        assert_eq!(
            binary.get_value("k").await.unwrap(),
            Some(StoredValue::Binary(b"hello".to_vec()))
        );

        store
            .set_with_ttl("raw", &[0xff, 0xfe], Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(
            text.get_value("raw").await,
            Err(CoordinationError::Decode { .. })
        ));
        assert_eq!(
            binary.get_value("raw").await.unwrap().unwrap().as_bytes(),
            &[0xff, 0xfe]
        );
    }

    #[tokio::test]
    async fn decode_flag_can_be_chosen_per_lookup() {
        let registry = StoreRegistry::empty();
        let store = MemoryStore::new();
        registry.register("default", store.clone(), true).await;
        store
            .set_with_ttl("k", b"hello", Duration::from_secs(10))
            .await
            .unwrap();

        let raw = registry.get_interface_with("default", false).await.unwrap();
        let text = registry.get_interface_with("default", true).await.unwrap();
        assert!(Arc::ptr_eq(raw.store(), text.store()));
        assert_eq!(
            raw.get_value("k").await.unwrap(),
            Some(StoredValue::Binary(b"hello".to_vec()))
        );
        assert_eq!(
            text.get_value("k").await.unwrap(),
            Some(StoredValue::Text("hello".to_string()))
        );

        // The cached handle keeps its registered flag.
        assert!(registry.get_interface("default").await.unwrap().decode_responses());
        assert!(registry
            .get_interface_with("missing", false)
            .await
            .unwrap_err()
            .is_config());
    }

    #[tokio::test]
    async fn slow_connect_does_not_block_other_stores() {
        // Accepts connections and never answers, so the connect hangs.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = crate::config::parse_config(&format!(
            "stores:\n  silent:\n    endpoint: redis://{addr}\n    tls: false\n    command_timeout_ms: 60000\n"
        ))
        .unwrap();
        let registry = Arc::new(StoreRegistry::from_config(&config));
        registry.register("default", MemoryStore::new(), true).await;

        let connecting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_interface("silent").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connecting.is_finished());

        let handle = tokio::time::timeout(
            Duration::from_secs(1),
            registry.get_interface("default"),
        )
        .await
        .expect("lookup of a cached store waited on another store's connect")
        .unwrap();
        assert_eq!(handle.name(), "default");
        assert_eq!(registry.names().await, vec!["default", "silent"]);

        connecting.abort();
        silent.abort();
    }

    #[tokio::test]
    async fn names_merge_configured_and_registered() {
        let config = crate::config::parse_config(
            r#"
stores:
  tasks:
    endpoint: redis://127.0.0.1
"#,
        )
        .unwrap();
        let registry = StoreRegistry::from_config(&config);
        registry.register("cache", MemoryStore::new(), true).await;
        assert_eq!(registry.names().await, vec!["cache", "tasks"]);
    }

    #[tokio::test]
    async fn semaphore_by_name_uses_registered_store() {
        let registry = StoreRegistry::empty().with_semaphore_mode(SemaphoreMode::Atomic);
        let store = MemoryStore::new();
        registry.register("default", store.clone(), true).await;

        let ttl = Duration::from_secs(60);
        assert!(registry.create_semaphore("default", "enqueue:1", ttl).await.unwrap());
        assert!(!registry.create_semaphore("default", "enqueue:1", ttl).await.unwrap());
        registry.delete_semaphore("default", "enqueue:1").await.unwrap();
        assert!(store.is_empty());

        let err = registry
            .create_semaphore("nope", "enqueue:1", ttl)
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn close_forgets_registered_handles() {
        let registry = StoreRegistry::empty();
        registry.register("default", MemoryStore::new(), true).await;
        registry.close().await;
        assert!(registry.get_interface("default").await.is_err());
    }

    #[test]
    fn acquire_options_follow_lock_config() {
        let config = crate::config::parse_config(
            r#"
stores:
  default:
    endpoint: redis://127.0.0.1
locks:
  retry_interval_ms: 250
  acquire_timeout_secs: 5
"#,
        )
        .unwrap();
        let options = StoreRegistry::from_config(&config).acquire_options();
        assert_eq!(options.retry_interval, Duration::from_millis(250));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
    }
}
