//! Reconciliation engine
//!
//! The engine runs one reconciliation cycle per call to
//! [`ReconciliationEngine::process`]:
//!
//! ```text
//! ┌────────────┐   capture    ┌──────────────┐
//! │ConfigStore │─────────────►│ Generation #n│ (config + client + pool)
//! └────────────┘              └──────────────┘
//!                                     │
//!        ┌────────────────────────────┼───────────────────────────┐
//!        ▼                            ▼                           ▼
//! ┌─────────────┐           ┌──────────────────┐        ┌──────────────────┐
//! │resolve ipv4 │           │ resolve ipv6     │        │  (families off   │
//! │ (pool task) │           │  (pool task)     │        │   are skipped)   │
//! └─────────────┘           └──────────────────┘        └──────────────────┘
//!        └────────────┬───────────────┘
//!                     ▼
//!      one pool task per (domain, family) with an address
//!        list → create | compare → update each mismatch
//!                     ▼
//!            wait for every handle → CycleReport
//! ```
//!
//! ## Guarantees
//!
//! 1. Resolution strictly precedes reconciliation within a cycle
//! 2. A family whose resolution fails gets no record tasks that cycle
//! 3. Record tasks are independent; one failing never fails its siblings
//! 4. No retries inside a cycle; the next cycle is the retry
//! 5. `process` returns only after every submitted task has settled or the
//!    governing token fired

use crate::config::Domain;
use crate::error::{Error, Result};
use crate::store::{ConfigStore, Generation};
use crate::traits::{DnsProvider, DnsRecord, IpSource, IpVersion, RecordType};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Most recently resolved public addresses
///
/// Refreshed at the start of every cycle. A family that fails to resolve is
/// emptied so a stale address is never written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl ResolvedAddresses {
    /// Address for `version`, if resolved
    pub fn get(&self, version: IpVersion) -> Option<IpAddr> {
        match version {
            IpVersion::V4 => self.ipv4.map(IpAddr::V4),
            IpVersion::V6 => self.ipv6.map(IpAddr::V6),
        }
    }

    /// Store `ip` in the slot for its family
    pub fn set(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => self.ipv4 = Some(v4),
            IpAddr::V6(v6) => self.ipv6 = Some(v6),
        }
    }
}

/// Result of reconciling one (hostname, record type) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// No record existed; one was created
    Created {
        /// Identifier assigned by the provider
        record_id: String,
    },
    /// One or more existing records were rewritten
    Updated {
        /// How many records were updated
        records: usize,
    },
    /// Every existing record already matched
    Unchanged,
}

/// A record task that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub hostname: String,
    pub record_type: RecordType,
    pub error: String,
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Generation the cycle ran against
    pub generation: u64,
    /// Wall-clock start of the cycle
    pub started_at: DateTime<Utc>,
    /// Time from start until every task settled
    pub duration: Duration,
    /// Addresses used for this cycle
    pub addresses: ResolvedAddresses,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cancelled: usize,
    pub failures: Vec<TaskFailure>,
}

impl CycleReport {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            addresses: ResolvedAddresses::default(),
            created: 0,
            updated: 0,
            unchanged: 0,
            cancelled: 0,
            failures: Vec::new(),
        }
    }

    /// Number of record tasks that failed
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Number of record tasks that settled, whatever their outcome
    pub fn settled(&self) -> usize {
        self.created + self.updated + self.unchanged + self.cancelled + self.failed()
    }

    fn record(&mut self, outcome: UpdateResult) {
        match outcome {
            UpdateResult::Created { .. } => self.created += 1,
            UpdateResult::Updated { .. } => self.updated += 1,
            UpdateResult::Unchanged => self.unchanged += 1,
        }
    }
}

/// Core reconciliation engine
///
/// Cheap to share behind an `Arc`; `process` may be called repeatedly.
pub struct ReconciliationEngine {
    store: Arc<ConfigStore>,
    resolver: Arc<dyn IpSource>,
    addresses: Mutex<ResolvedAddresses>,
}

impl ReconciliationEngine {
    /// Create an engine over `store`, resolving addresses with `resolver`
    pub fn new(store: Arc<ConfigStore>, resolver: Arc<dyn IpSource>) -> Self {
        Self {
            store,
            resolver,
            addresses: Mutex::new(ResolvedAddresses::default()),
        }
    }

    /// The configuration store this engine reads from
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Addresses resolved by the latest cycle
    pub fn addresses(&self) -> ResolvedAddresses {
        *self.addresses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check that the configured zone is visible to the credential
    ///
    /// A rejected credential yields `Ok(false)` like a wrong zone does; other
    /// failures (network, timeout, cancellation) are returned as errors.
    pub async fn validate_zone(&self, ctx: &CancellationToken) -> Result<bool> {
        let generation = self.store.current();
        let zone_id = generation.config().zone_id.clone();
        let timeout = generation.config().timeout;
        let provider = Arc::clone(generation.provider());

        let handle = generation
            .pool()
            .submit(ctx, move |token| async move {
                bounded(timeout, &token, provider.list_zones()).await
            })
            .await?;

        match handle.wait(ctx).await {
            Ok(zones) => {
                let valid = zones.iter().any(|zone| *zone == zone_id);
                if !valid {
                    warn!(zone_id = %zone_id, visible = zones.len(), "zone not visible to token");
                }
                Ok(valid)
            }
            Err(Error::Authentication(message)) => {
                warn!(
                    zone_id = %zone_id,
                    error = %message,
                    "token rejected during zone validation"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run one full reconciliation cycle
    ///
    /// Partial success is a normal outcome and is reported, not returned as
    /// an error.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] when the pool stopped admitting work
    /// - [`Error::Cancelled`] when `ctx` fired before any record work started
    pub async fn process(&self, ctx: &CancellationToken) -> Result<CycleReport> {
        let generation = self.store.current();
        let started = Instant::now();
        let mut report = CycleReport::new(generation.id());

        let addresses = self.resolve_addresses(&generation, ctx).await?;
        report.addresses = addresses;

        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let config = Arc::clone(generation.config());
        let mut tasks = Vec::with_capacity(config.domains.len() * 2);
        let mut unavailable = false;

        'submit: for domain in &config.domains {
            for version in config.enabled_versions() {
                let Some(address) = addresses.get(version) else {
                    continue;
                };

                let job = RecordJob {
                    provider: Arc::clone(generation.provider()),
                    zone_id: config.zone_id.clone(),
                    domain: domain.clone(),
                    record_type: version.record_type(),
                    address,
                    timeout: config.timeout,
                };

                match generation.pool().submit(ctx, move |token| job.run(token)).await {
                    Ok(handle) => {
                        tasks.push((domain.hostname.clone(), version.record_type(), handle))
                    }
                    Err(e) => {
                        error!(
                            hostname = %domain.hostname,
                            record_type = %version.record_type(),
                            error = %e,
                            "failed to submit record task"
                        );
                        unavailable = e.is_unavailable();
                        report.failures.push(TaskFailure {
                            hostname: domain.hostname.clone(),
                            record_type: version.record_type(),
                            error: e.to_string(),
                        });
                        if unavailable {
                            break 'submit;
                        }
                    }
                }
            }
        }

        for (hostname, record_type, handle) in tasks {
            match handle.wait(ctx).await {
                Ok(outcome) => report.record(outcome),
                Err(Error::Cancelled) => {
                    warn!(
                        hostname = %hostname,
                        record_type = %record_type,
                        "record task cancelled"
                    );
                    report.cancelled += 1;
                }
                Err(e) => {
                    error!(
                        hostname = %hostname,
                        record_type = %record_type,
                        error = %e,
                        "record task failed"
                    );
                    report.failures.push(TaskFailure {
                        hostname,
                        record_type,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration = started.elapsed();

        if unavailable {
            return Err(Error::PoolClosed);
        }

        Ok(report)
    }

    /// Wait until the active pool has settled everything submitted so far
    pub async fn wait(&self) {
        let generation = self.store.current();
        generation.pool().wait_idle().await;
    }

    /// Abort in-flight work and refuse new submissions
    pub fn close(&self) {
        self.store.abort();
    }

    async fn resolve_addresses(
        &self,
        generation: &Generation,
        ctx: &CancellationToken,
    ) -> Result<ResolvedAddresses> {
        let mut pending = Vec::with_capacity(2);

        for version in generation.config().enabled_versions() {
            let resolver = Arc::clone(&self.resolver);
            let handle = generation
                .pool()
                .submit(ctx, move |token| async move {
                    resolver.resolve(version, &token).await
                })
                .await?;
            pending.push((version, handle));
        }

        let previous = self.addresses();
        let mut resolved = ResolvedAddresses::default();

        for (version, handle) in pending {
            match handle.wait(ctx).await {
                Ok(ip) if version.matches(&ip) => {
                    if previous.get(version) != Some(ip) {
                        info!(family = %version, address = %ip, "updated {} address", version);
                    } else {
                        debug!(family = %version, address = %ip, "public address unchanged");
                    }
                    resolved.set(ip);
                }
                Ok(ip) => {
                    error!(
                        family = %version,
                        address = %ip,
                        "resolver returned an address of the wrong family"
                    );
                }
                Err(e) => {
                    error!(
                        family = %version,
                        error = %e,
                        "failed to get public {} address",
                        version
                    );
                }
            }
        }

        *self.addresses.lock().unwrap_or_else(PoisonError::into_inner) = resolved;
        Ok(resolved)
    }
}

/// Everything one record task needs, passed by value into the pool
struct RecordJob {
    provider: Arc<dyn DnsProvider>,
    zone_id: String,
    domain: Domain,
    record_type: RecordType,
    address: IpAddr,
    timeout: Duration,
}

impl RecordJob {
    async fn run(self, token: CancellationToken) -> Result<UpdateResult> {
        let hostname = self.domain.hostname.as_str();
        let content = self.address.to_string();

        let records = bounded(
            self.timeout,
            &token,
            self.provider.list_records(&self.zone_id, hostname, self.record_type),
        )
        .await?;

        if records.is_empty() {
            let created = bounded(
                self.timeout,
                &token,
                self.provider.create_record(
                    &self.zone_id,
                    hostname,
                    self.record_type,
                    &content,
                    self.domain.proxied,
                ),
            )
            .await?;

            info!(
                id = %created.id,
                hostname = %created.name,
                record_type = %created.record_type,
                address = %created.content,
                "created DNS record"
            );
            return Ok(UpdateResult::Created {
                record_id: created.id,
            });
        }

        let mut updated = 0;
        let mut last_error = None;

        for record in &records {
            if record_matches(record, self.address, self.domain.proxied) {
                debug!(
                    id = %record.id,
                    hostname = %record.name,
                    record_type = %record.record_type,
                    address = %record.content,
                    "skipping DNS record"
                );
                continue;
            }

            let result = bounded(
                self.timeout,
                &token,
                self.provider.update_record(
                    &self.zone_id,
                    &record.id,
                    &content,
                    self.domain.proxied,
                ),
            )
            .await;

            match result {
                Ok(new) => {
                    info!(
                        id = %new.id,
                        hostname = %new.name,
                        record_type = %new.record_type,
                        address = %new.content,
                        previous = %record.content,
                        "updated DNS record"
                    );
                    updated += 1;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(
                        id = %record.id,
                        hostname = %record.name,
                        record_type = %record.record_type,
                        address = %record.content,
                        error = %e,
                        "failed to update DNS record"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        Ok(if updated == 0 {
            UpdateResult::Unchanged
        } else {
            UpdateResult::Updated { records: updated }
        })
    }
}

/// Whether `record` already carries `address` and the requested proxy setting
///
/// The proxy setting only counts when both sides specify one. Content is
/// compared as parsed addresses so equal IPv6 spellings match.
pub fn record_matches(record: &DnsRecord, address: IpAddr, proxied: Option<bool>) -> bool {
    let content_matches = match record.content.trim().parse::<IpAddr>() {
        Ok(current) => current == address,
        Err(_) => record.content == address.to_string(),
    };

    let proxied_matches = match (record.proxied, proxied) {
        (Some(current), Some(requested)) => current == requested,
        _ => true,
    };

    content_matches && proxied_matches
}

/// Run one provider call under a deadline and a cancellation token
pub(crate) async fn bounded<T, F>(limit: Duration, cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        },
    }
}
