//! KeyDB / Redis backed [`CoordinationStore`].
//!
//! Builds a [`fred::clients::Pool`] configured for one entry of
//! [`crate::config::Config::stores`], optionally enabling TLS via `rustls`
//! and reading the auth token from an environment variable.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions, Value};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::coordination::store::CoordinationStore;
use crate::error::{ttl_millis, CoordinationError, Result};

/// Compare-and-delete.  Runs server-side so no other client can slip a write
/// between the GET and the DEL.
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// A pooled connection to one logical KeyDB / Redis database.
#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect a pool for `config` and wrap it.
    pub async fn connect(name: &str, config: &StoreConfig) -> Result<Self> {
        let pool = create_keydb_pool(name, config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl CoordinationStore for KeyDbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Value = self.pool.get(key).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(value.as_bytes().map(<[u8]>::to_vec))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let px = ttl_millis(ttl)?;
        let _: () = self
            .pool
            .set(
                key,
                Bytes::copy_from_slice(value),
                Some(Expiration::PX(px)),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let removed: i64 = self.pool.del(key).await?;
        Ok(removed.max(0) as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.pool.exists(key).await?;
        Ok(exists)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let px = ttl_millis(ttl)?;
        let result: Option<String> = self
            .pool
            .set(
                key,
                Bytes::copy_from_slice(value),
                Some(Expiration::PX(px)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        Ok(result.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let deleted: i64 = self
            .pool
            .eval(
                DELETE_IF_EQUALS_SCRIPT,
                vec![key.to_string()],
                vec![Bytes::copy_from_slice(expected)],
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.quit().await?;
        debug!("KeyDB pool closed");
        Ok(())
    }
}

/// Create a KeyDB connection pool for the store called `name`.
///
/// The pool is initialised (connected + PING verified) before being returned.
/// The auth token is read from the environment variable named by
/// `config.auth_token_env`; a missing variable means no password.
pub async fn create_keydb_pool(name: &str, config: &StoreConfig) -> Result<Pool> {
    let builder = keydb_builder(config)?;
    let pool = builder.build_pool(config.pool_size)?;

    pool.init().await?;

    let _: String = pool.ping(None).await?;

    info!(
        store = name,
        endpoint = %config.endpoint,
        database = ?config.database,
        tls = config.tls,
        pool_size = config.pool_size,
        command_timeout_ms = config.command_timeout_ms,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Client settings for one store, before any connection is made.
///
/// Commands are sent once and bounded by `config.command_timeout_ms`, so a
/// command issued while the server is down or the pool is reconnecting
/// fails instead of queueing until the server returns.
fn keydb_builder(config: &StoreConfig) -> Result<Builder> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may carry a `rediss://` or `redis://` scheme prefix.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        database: config.database,
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let command_timeout = config.command_timeout();
    let mut builder = Builder::from_config(fred_config);
    builder
        .with_performance_config(|perf| {
            perf.default_command_timeout = command_timeout;
        })
        .with_connection_config(|conn| {
            conn.max_command_attempts = 1;
            conn.connection_timeout = command_timeout;
            conn.internal_command_timeout = command_timeout;
        });

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    Ok(builder)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a `/0` database suffix).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if endpoint.is_empty() {
        return Err(CoordinationError::Config("empty store endpoint".to_string()));
    }

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str.parse().map_err(|_| {
            CoordinationError::Config(format!("invalid port in endpoint: {endpoint}"))
        })?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}
