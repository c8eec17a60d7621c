//! Test doubles and common utilities for contract tests
//!
//! The doubles record every call so tests can assert on the exact set of
//! mutations a cycle issued.

#![allow(dead_code)]

use async_trait::async_trait;
use cfdns_core::error::{Error, Result};
use cfdns_core::traits::{
    DnsProvider, DnsProviderFactory, DnsRecord, IpSource, IpVersion, RecordType,
};
use cfdns_core::{Config, ConfigStore, Domain, ReconciliationEngine};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ZONE: &str = "zone-123";
pub const TOKEN: &str = "test-token";

/// A create call as the provider received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCall {
    pub hostname: String,
    pub record_type: RecordType,
    pub content: String,
    pub proxied: Option<bool>,
}

/// An update call as the provider received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCall {
    pub record_id: String,
    pub content: String,
    pub proxied: Option<bool>,
}

/// In-memory DNS provider that tracks calls
pub struct MockDnsProvider {
    records: Mutex<HashMap<(String, RecordType), Vec<DnsRecord>>>,
    zones: Mutex<Vec<String>>,
    creates: Mutex<Vec<CreateCall>>,
    updates: Mutex<Vec<UpdateCall>>,
    failing_hosts: Mutex<HashSet<String>>,
    /// Artificial latency of update calls
    update_delay: Mutex<Option<Duration>>,
    reject_token: Mutex<bool>,
    list_calls: AtomicUsize,
    update_started: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockDnsProvider {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            zones: Mutex::new(vec![ZONE.to_string()]),
            creates: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            failing_hosts: Mutex::new(HashSet::new()),
            update_delay: Mutex::new(None),
            reject_token: Mutex::new(false),
            list_calls: AtomicUsize::new(0),
            update_started: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Seed an existing record and return its id
    pub fn seed(
        &self,
        hostname: &str,
        record_type: RecordType,
        content: &str,
        proxied: Option<bool>,
    ) -> String {
        let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records
            .lock()
            .unwrap()
            .entry((hostname.to_string(), record_type))
            .or_default()
            .push(DnsRecord {
                id: id.clone(),
                name: hostname.to_string(),
                record_type,
                content: content.to_string(),
                proxied,
            });
        id
    }

    pub fn set_zones(&self, zones: &[&str]) {
        *self.zones.lock().unwrap() = zones.iter().map(|z| z.to_string()).collect();
    }

    /// Make every call for `hostname` fail with a provider error
    pub fn fail_host(&self, hostname: &str) {
        self.failing_hosts.lock().unwrap().insert(hostname.to_string());
    }

    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = Some(delay);
    }

    /// Make `list_zones` answer with an authentication error
    pub fn reject_token(&self) {
        *self.reject_token.lock().unwrap() = true;
    }

    pub fn creates(&self) -> Vec<CreateCall> {
        self.creates.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<UpdateCall> {
        self.updates.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Update calls that started, whether or not they completed
    pub fn update_started(&self) -> usize {
        self.update_started.load(Ordering::SeqCst)
    }

    pub fn records(&self, hostname: &str, record_type: RecordType) -> Vec<DnsRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(hostname.to_string(), record_type))
            .cloned()
            .unwrap_or_default()
    }

    fn check_host(&self, hostname: &str) -> Result<()> {
        if self.failing_hosts.lock().unwrap().contains(hostname) {
            return Err(Error::provider("mock", format!("{} rejected", hostname)));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    async fn list_records(
        &self,
        _zone_id: &str,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_host(hostname)?;
        Ok(self.records(hostname, record_type))
    }

    async fn create_record(
        &self,
        _zone_id: &str,
        hostname: &str,
        record_type: RecordType,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord> {
        self.check_host(hostname)?;
        self.creates.lock().unwrap().push(CreateCall {
            hostname: hostname.to_string(),
            record_type,
            content: content.to_string(),
            proxied,
        });
        let id = self.seed(hostname, record_type, content, proxied);
        Ok(DnsRecord {
            id,
            name: hostname.to_string(),
            record_type,
            content: content.to_string(),
            proxied,
        })
    }

    async fn update_record(
        &self,
        _zone_id: &str,
        record_id: &str,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord> {
        self.update_started.fetch_add(1, Ordering::SeqCst);

        let delay = *self.update_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut records = self.records.lock().unwrap();
        let record = records
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|r| r.id == record_id)
            .ok_or_else(|| Error::not_found(record_id.to_string()))?;

        if self.failing_hosts.lock().unwrap().contains(&record.name) {
            return Err(Error::provider("mock", format!("{} rejected", record.name)));
        }

        record.content = content.to_string();
        if proxied.is_some() {
            record.proxied = proxied;
        }
        self.updates.lock().unwrap().push(UpdateCall {
            record_id: record_id.to_string(),
            content: content.to_string(),
            proxied,
        });
        Ok(record.clone())
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        if *self.reject_token.lock().unwrap() {
            return Err(Error::auth("invalid token"));
        }
        Ok(self.zones.lock().unwrap().clone())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// Factory that hands out one shared [`MockDnsProvider`]
pub struct MockFactory {
    pub provider: Arc<MockDnsProvider>,
    created: AtomicUsize,
}

impl MockFactory {
    pub fn new(provider: Arc<MockDnsProvider>) -> Self {
        Self {
            provider,
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl DnsProviderFactory for MockFactory {
    fn create(&self, credential: &str, _timeout: Duration) -> Result<Arc<dyn DnsProvider>> {
        if credential.is_empty() {
            return Err(Error::auth("empty credential"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.provider.clone())
    }
}

/// IP source answering from fixed, swappable addresses
pub struct StaticIpSource {
    v4: Mutex<Option<IpAddr>>,
    v6: Mutex<Option<IpAddr>>,
    calls: AtomicUsize,
}

impl StaticIpSource {
    pub fn new(v4: Option<&str>, v6: Option<&str>) -> Self {
        Self {
            v4: Mutex::new(v4.map(|ip| ip.parse().unwrap())),
            v6: Mutex::new(v6.map(|ip| ip.parse().unwrap())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_v4(&self, ip: Option<&str>) {
        *self.v4.lock().unwrap() = ip.map(|ip| ip.parse().unwrap());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpSource for StaticIpSource {
    async fn resolve(&self, version: IpVersion, cancel: &CancellationToken) -> Result<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let ip = match version {
            IpVersion::V4 => *self.v4.lock().unwrap(),
            IpVersion::V6 => *self.v6.lock().unwrap(),
        };
        ip.ok_or(Error::NoAddressAvailable(version.as_str()))
    }
}

/// Minimal valid configuration for `hostnames`
pub fn config_for(hostnames: &[&str], ipv4: bool, ipv6: bool) -> Config {
    Config::new(ZONE, TOKEN, hostnames.iter().map(|h| Domain::new(*h)).collect())
        .with_families(ipv4, ipv6)
        .with_workers(4)
        .with_timeout(Duration::from_secs(2))
}

/// Wire an engine around the doubles
pub fn engine_with(
    provider: Arc<MockDnsProvider>,
    ip_source: Arc<StaticIpSource>,
    config: Config,
) -> (Arc<MockFactory>, Arc<ReconciliationEngine>) {
    let factory = Arc::new(MockFactory::new(provider));
    let store = Arc::new(ConfigStore::new(config, factory.clone()).expect("store builds"));
    let engine = Arc::new(ReconciliationEngine::new(store, ip_source));
    (factory, engine)
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
