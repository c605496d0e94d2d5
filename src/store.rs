//! Store selection and wiring.
//!
//! Builds the counter and cache stores named by configuration so the rest of
//! the crate only sees `Arc<dyn CounterStore>` and `Arc<dyn CacheStore>`.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache::{CacheStore, MemoryCacheStore, RedisCacheStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{StoreBackend, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Open a managed connection to the configured server and verify it.
pub async fn connect(info: impl IntoConnectionInfo) -> Result<ConnectionManager> {
    let client = Client::open(info).map_err(|e| {
        error!(error = %e, "Failed to create Redis client");
        TurnstileError::StoreUnavailable(format!("invalid store connection settings: {}", e))
    })?;

    let manager = ConnectionManager::new(client).await.map_err(|e| {
        error!(error = %e, "Failed to create connection manager");
        TurnstileError::from(e)
    })?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Failed to ping store");
        TurnstileError::from(e)
    })?;

    debug!("Store connection established");
    Ok(manager)
}

/// Counter and cache stores for one process.
#[derive(Debug)]
pub struct Backends {
    /// Rate limit counters
    pub counters: Arc<dyn CounterStore>,
    /// Cache entries and tag sets
    pub cache: Arc<dyn CacheStore>,
    /// Clock the stores were built with
    pub clock: Arc<dyn Clock>,
    janitor: Option<JoinHandle<()>>,
}

impl Backends {
    /// In-process stores driven by `clock`, without a janitor.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(MemoryCounterStore::with_clock(clock.clone())),
            cache: Arc::new(MemoryCacheStore::with_clock(clock.clone())),
            clock,
            janitor: None,
        }
    }

    /// Build the stores selected by `config.store`.
    ///
    /// In-memory stores get a janitor task purging expired entries when
    /// `janitor_interval_secs` is non-zero; it must run inside a tokio
    /// runtime.
    pub async fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let store = &config.store;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        match store.backend {
            StoreBackend::Memory => {
                let counters = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
                let cache = Arc::new(MemoryCacheStore::with_clock(clock.clone()));

                let janitor = (store.janitor_interval_secs > 0).then(|| {
                    spawn_janitor(
                        counters.clone(),
                        cache.clone(),
                        Duration::from_secs(store.janitor_interval_secs),
                    )
                });

                info!("Using in-memory stores");
                Ok(Self {
                    counters,
                    cache,
                    clock,
                    janitor,
                })
            }
            StoreBackend::Redis => {
                let manager = connect(store.connection_info()).await?;
                let cache_namespace = format!("{}{}", store.key_prefix, config.cache.namespace);

                info!(
                    host = %store.host,
                    port = store.port,
                    database = store.database,
                    "Using redis stores"
                );
                Ok(Self {
                    counters: Arc::new(RedisCounterStore::with_clock(
                        manager.clone(),
                        store.key_prefix.clone(),
                        clock.clone(),
                    )),
                    cache: Arc::new(RedisCacheStore::new(manager, cache_namespace)),
                    clock,
                    janitor: None,
                })
            }
        }
    }

    /// Whether a background purge task is running.
    pub fn has_janitor(&self) -> bool {
        self.janitor.is_some()
    }
}

impl Drop for Backends {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

/// Periodically drop expired windows and cache entries.
pub fn spawn_janitor(
    counters: Arc<MemoryCounterStore>,
    cache: Arc<MemoryCacheStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let windows = counters.purge_expired();
            let entries = cache.purge_expired();
            debug!(windows = windows, entries = entries, "Janitor pass completed");
        }
    })
}
