//! Hot-swappable configuration store
//!
//! The active configuration, its credentialed provider client and its worker
//! pool form one immutable [`Generation`]. The store publishes generations
//! through an [`ArcSwap`]; a reconciliation cycle captures the current
//! generation once and uses it to the end, so replacing the configuration
//! never tears down a pool that a running cycle still holds.
//!
//! ```text
//!             replace(cfg)                        process()
//!                  │                                  │
//!   build client + pool (if changed)        load_full() ─► Arc<Generation #n>
//!                  │                                  │        (held for the cycle)
//!        store(Generation #n+1) ──────────────────────┘
//!                  │
//!   Generation #n dropped by the last holder ─► its pool closes
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::traits::{DnsProvider, DnsProviderFactory};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// One immutable snapshot of configuration plus the resources built from it
pub struct Generation {
    id: u64,
    config: Arc<Config>,
    provider: Arc<dyn DnsProvider>,
    pool: Arc<WorkerPool>,
}

impl Generation {
    /// Monotonic generation number, starting at 1
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Configuration of this generation
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Credentialed provider client
    pub fn provider(&self) -> &Arc<dyn DnsProvider> {
        &self.provider
    }

    /// Worker pool sized to this generation's concurrency limit
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("provider", &self.provider.provider_name())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        // the pool closes itself once its last generation lets go of it
        debug!(generation = self.id, "configuration generation retired");
    }
}

/// Holder of the active [`Generation`]
pub struct ConfigStore {
    current: ArcSwap<Generation>,
    factory: Arc<dyn DnsProviderFactory>,
    /// Serialises writers; readers never take it
    write: Mutex<()>,
    next_id: AtomicU64,
}

impl ConfigStore {
    /// Build the first generation from `config`
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the factory cannot build a
    /// credentialed client. Both are startup-fatal.
    pub fn new(config: Config, factory: Arc<dyn DnsProviderFactory>) -> Result<Self> {
        config.validate()?;

        let provider = factory.create(&config.token, config.timeout)?;
        let pool = Arc::new(WorkerPool::new(config.workers));
        let generation = Generation {
            id: 1,
            config: Arc::new(config),
            provider,
            pool,
        };

        Ok(Self {
            current: ArcSwap::from_pointee(generation),
            factory,
            write: Mutex::new(()),
            next_id: AtomicU64::new(2),
        })
    }

    /// Capture the active generation
    ///
    /// Hold the returned `Arc` for as long as its pool and client are in use.
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Read-only snapshot of the active configuration
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(self.current.load().config())
    }

    /// Atomically replace the active configuration
    ///
    /// A new client is built when the credential or timeout changed, a new
    /// pool when the worker count changed; otherwise the previous ones carry
    /// over. On any error the previous generation stays active untouched.
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;

        let _writer = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current.load_full();

        let provider = if previous.config.client_changed(&config) {
            self.factory.create(&config.token, config.timeout)?
        } else {
            Arc::clone(&previous.provider)
        };

        let rebuilt_pool = previous.config.pool_changed(&config);
        let pool = if rebuilt_pool {
            Arc::new(WorkerPool::new(config.workers))
        } else {
            Arc::clone(&previous.pool)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = Arc::new(Generation {
            id,
            config: Arc::new(config),
            provider,
            pool,
        });

        self.current.store(generation);

        info!(
            generation = id,
            previous = previous.id,
            rebuilt_pool,
            "configuration replaced"
        );

        Ok(())
    }

    /// Abort the active pool, cancelling its queued and in-flight work
    pub fn abort(&self) {
        self.current.load().pool().abort();
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("current", &self.current.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Domain;
    use crate::error::Error;
    use crate::traits::{DnsRecord, RecordType};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct NullProvider;

    #[async_trait]
    impl DnsProvider for NullProvider {
        async fn list_records(&self, _: &str, _: &str, _: RecordType) -> Result<Vec<DnsRecord>> {
            Ok(Vec::new())
        }

        async fn create_record(
            &self,
            _: &str,
            _: &str,
            _: RecordType,
            _: &str,
            _: Option<bool>,
        ) -> Result<DnsRecord> {
            Err(Error::not_found("unused"))
        }

        async fn update_record(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<bool>,
        ) -> Result<DnsRecord> {
            Err(Error::not_found("unused"))
        }

        async fn list_zones(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn provider_name(&self) -> &'static str {
            "null"
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl DnsProviderFactory for CountingFactory {
        fn create(&self, credential: &str, _timeout: Duration) -> Result<Arc<dyn DnsProvider>> {
            if credential == "bad" {
                return Err(Error::auth("rejected credential"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullProvider))
        }
    }

    fn config(token: &str, workers: usize) -> Config {
        Config::new("zone", token, vec![Domain::new("a.example.com")])
            .with_families(true, false)
            .with_workers(workers)
    }

    #[tokio::test]
    async fn replace_publishes_a_new_generation() {
        let factory = Arc::new(CountingFactory::default());
        let store = assert_ok!(ConfigStore::new(config("t1", 2), factory.clone()));
        assert_eq!(store.current().id(), 1);

        let mut next = config("t1", 2);
        next.domains.push(Domain::new("b.example.com"));
        assert_ok!(store.replace(next));

        let current = store.current();
        assert_eq!(current.id(), 2);
        assert_eq!(store.get().domains.len(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1, "client reused");
    }

    #[tokio::test]
    async fn unchanged_worker_count_keeps_the_pool() {
        let factory = Arc::new(CountingFactory::default());
        let store = ConfigStore::new(config("t1", 2), factory).unwrap();
        let before = Arc::clone(store.current().pool());

        store.replace(config("t2", 2)).unwrap();
        assert!(Arc::ptr_eq(&before, store.current().pool()));
        assert!(!before.is_closed());
    }

    #[tokio::test]
    async fn changed_worker_count_rebuilds_and_retires_the_pool() {
        let factory = Arc::new(CountingFactory::default());
        let store = ConfigStore::new(config("t1", 2), factory).unwrap();
        let old_pool = Arc::downgrade(store.current().pool());

        store.replace(config("t1", 4)).unwrap();
        assert_eq!(store.current().pool().workers(), 4);
        assert!(old_pool.upgrade().is_none(), "old pool released with its generation");
    }

    #[tokio::test]
    async fn held_generation_keeps_its_pool_open() {
        let factory = Arc::new(CountingFactory::default());
        let store = ConfigStore::new(config("t1", 2), factory).unwrap();
        let held = store.current();

        store.replace(config("t1", 3)).unwrap();
        assert!(!held.pool().is_closed());
        assert_eq!(held.pool().workers(), 2);
    }

    #[tokio::test]
    async fn failed_replace_keeps_previous_generation() {
        let factory = Arc::new(CountingFactory::default());
        let store = ConfigStore::new(config("t1", 2), factory).unwrap();

        assert_err!(store.replace(config("bad", 2)));
        assert_err!(store.replace(Config::new("", "t", Vec::new())));

        let current = store.current();
        assert_eq!(current.id(), 1);
        assert_eq!(current.config().token, "t1");
    }

    #[tokio::test]
    async fn replace_refuses_durations_below_the_floors() {
        let factory = Arc::new(CountingFactory::default());
        let store = ConfigStore::new(config("t1", 2), factory).unwrap();

        let mut busy_loop = config("t1", 2);
        busy_loop.frequency = Duration::ZERO;
        assert!(matches!(store.replace(busy_loop), Err(Error::Config(_))));

        let instant_timeout = config("t1", 2).with_timeout(Duration::ZERO);
        assert!(matches!(store.replace(instant_timeout), Err(Error::Config(_))));

        let current = store.current();
        assert_eq!(current.id(), 1);
        assert_eq!(current.config().frequency, crate::config::DEFAULT_FREQUENCY);
        assert_eq!(current.config().timeout, crate::config::DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn construction_fails_without_client() {
        let result = ConfigStore::new(config("bad", 2), Arc::new(CountingFactory::default()));
        assert!(matches!(result, Err(Error::Authentication(_))));
    }
}
