// # DNS Provider Trait
//
// Defines the capability calls the engine needs from a DNS provider.
//
// ## Implementations
//
// - Cloudflare: `cfdns-provider-cloudflare` crate
//
// ## Usage
//
// ```rust,ignore
// use cfdns_core::traits::{DnsProvider, RecordType};
//
// let provider = /* DnsProvider implementation */;
// let records = provider
//     .list_records("zone-id", "a.example.com", RecordType::A)
//     .await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// DNS record type managed by cfdns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// IPv6 address record
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl RecordType {
    /// Wire name of the type
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as the provider reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Provider-assigned identifier
    pub id: String,
    /// Fully-qualified hostname
    pub name: String,
    /// Record type
    pub record_type: RecordType,
    /// Record content (an address literal)
    pub content: String,
    /// Proxy setting, when the provider reports one
    pub proxied: Option<bool>,
}

/// Trait for DNS provider implementations
///
/// Each call is a single request. Providers do not retry, do not cache and do
/// not decide whether a change is needed; the reconciliation engine owns all
/// of that. Deadlines are applied by the caller, and dropping the returned
/// future abandons the request.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// List records of `record_type` named `hostname` in `zone_id`
    async fn list_records(
        &self,
        zone_id: &str,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsRecord>, crate::Error>;

    /// Create a record; `proxied: None` leaves the provider default
    async fn create_record(
        &self,
        zone_id: &str,
        hostname: &str,
        record_type: RecordType,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord, crate::Error>;

    /// Update content (and proxy setting when given) of an existing record
    ///
    /// Never changes the record's type or identifier.
    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord, crate::Error>;

    /// List identifiers of every zone visible to the credential
    async fn list_zones(&self) -> Result<Vec<String>, crate::Error>;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing credentialed providers
pub trait DnsProviderFactory: Send + Sync {
    /// Create a provider client for `credential`
    ///
    /// # Parameters
    ///
    /// - `credential`: Zone-scoped API token
    /// - `timeout`: Transport-level request timeout
    fn create(
        &self,
        credential: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn DnsProvider>, crate::Error>;
}
