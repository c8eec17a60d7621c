// # Cloudflare DNS Provider
//
// This crate provides the Cloudflare implementation of the cfdns
// `DnsProvider` capability calls.
//
// ## Scope
//
// - One HTTP request per capability call (zone listing pages aside)
// - Full error propagation to the engine; the next cycle is the retry
// - Status codes mapped to typed errors (401/403, 404, 429, 5xx)
// - `success: false` envelopes surfaced with Cloudflare's own messages
// - NO retry, backoff, caching or background tasks
//
// ## Security Requirements
//
// - API token NEVER appears in logs or `Debug` output
// - Provider construction fails fast if the token is empty
//
// ## API Reference
//
// - Cloudflare API v4: https://developers.cloudflare.com/api/
// - List Zones: GET `/zones?page=..&per_page=..`
// - List DNS Records: GET `/zones/:zone_id/dns_records?name=...&type=...`
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Patch DNS Record: PATCH `/zones/:zone_id/dns_records/:record_id`

use async_trait::async_trait;
use cfdns_core::traits::{DnsProvider, DnsProviderFactory, DnsRecord, RecordType};
use cfdns_core::{Error, Result};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cloudflare API base URL
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Zones requested per page when listing
const ZONES_PER_PAGE: u32 = 50;

/// TTL value Cloudflare reads as "automatic"
const AUTOMATIC_TTL: u32 = 1;

const PROVIDER: &str = "cloudflare";

/// Standard Cloudflare v4 response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ZoneEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RecordEntry {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: RecordType,
    content: String,
    #[serde(default)]
    proxied: Option<bool>,
}

impl From<RecordEntry> for DnsRecord {
    fn from(entry: RecordEntry) -> Self {
        DnsRecord {
            id: entry.id,
            name: entry.name,
            record_type: entry.record_type,
            content: entry.content,
            proxied: entry.proxied,
        }
    }
}

/// Body of create (all fields) and patch (content/proxied only) requests
#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    record_type: Option<RecordType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
}

/// Cloudflare DNS provider
///
/// Stateless and single-shot: every call is one request (or one page
/// walk for zones) with the credential it was built with.
///
/// # Security
///
/// The Debug implementation intentionally does NOT expose the API token.
pub struct CloudflareProvider {
    /// Cloudflare API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// API root, overridable for tests
    base_url: String,

    /// HTTP client for API requests
    client: reqwest::Client,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Zone-scoped token with DNS read/write permission
    /// - `timeout`: Transport-level timeout of each request
    ///
    /// # Errors
    ///
    /// Fails when the token is empty or the HTTP client cannot be built.
    pub fn new(api_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_token,
            base_url: CLOUDFLARE_API_BASE.to_string(),
            client,
        })
    }

    /// Point the provider at another API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn records_url(&self, zone_id: &str) -> String {
        format!("{}/zones/{}/dns_records", self.base_url, zone_id)
    }

    /// Send an authenticated request and unwrap the v4 envelope
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Envelope<T>> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::http(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(status, what, &body));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            Error::provider(PROVIDER, format!("failed to parse {} response: {}", what, e))
        })?;

        if !envelope.success {
            return Err(Error::provider(
                PROVIDER,
                format!("{} rejected: {}", what, join_messages(&envelope.errors)),
            ));
        }

        Ok(envelope)
    }

    /// Unwrap a mandatory `result`
    fn result<T>(envelope: Envelope<T>, what: &str) -> Result<T> {
        envelope
            .result
            .ok_or_else(|| Error::provider(PROVIDER, format!("{} response has no result", what)))
    }
}

/// Map a non-success HTTP status to a typed error
fn status_error(status: StatusCode, what: &str, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!(
            "{}: invalid API token or insufficient permissions (status {})",
            what, status
        )),
        404 => Error::not_found(format!("{}: {}", what, status)),
        429 => Error::rate_limited(format!("{}: status {}", what, status)),
        500..=599 => Error::provider(
            PROVIDER,
            format!("{}: server error (transient): {} - {}", what, status, body),
        ),
        _ => Error::provider(PROVIDER, format!("{} failed: {} - {}", what, status, body)),
    }
}

fn join_messages(messages: &[ApiMessage]) -> String {
    if messages.is_empty() {
        return "no error details".to_string();
    }
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.code, m.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn list_records(
        &self,
        zone_id: &str,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsRecord>> {
        tracing::debug!(hostname, record_type = %record_type, "listing DNS records");

        let request = self
            .client
            .get(self.records_url(zone_id))
            .query(&[("name", hostname), ("type", record_type.as_str())]);

        let envelope: Envelope<Vec<RecordEntry>> = self.send(request, "list records").await?;
        Ok(envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(DnsRecord::from)
            .collect())
    }

    async fn create_record(
        &self,
        zone_id: &str,
        hostname: &str,
        record_type: RecordType,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord> {
        let body = RecordBody {
            record_type: Some(record_type),
            name: Some(hostname),
            content,
            ttl: Some(AUTOMATIC_TTL),
            proxied,
        };

        let request = self.client.post(self.records_url(zone_id)).json(&body);
        let envelope: Envelope<RecordEntry> = self.send(request, "create record").await?;
        Ok(Self::result(envelope, "create record")?.into())
    }

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        content: &str,
        proxied: Option<bool>,
    ) -> Result<DnsRecord> {
        let body = RecordBody {
            record_type: None,
            name: None,
            content,
            ttl: None,
            proxied,
        };

        let url = format!("{}/{}", self.records_url(zone_id), record_id);
        let request = self.client.patch(url).json(&body);
        let envelope: Envelope<RecordEntry> = self.send(request, "update record").await?;
        Ok(Self::result(envelope, "update record")?.into())
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        let mut zones = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .client
                .get(format!("{}/zones", self.base_url))
                .query(&[("page", page), ("per_page", ZONES_PER_PAGE)]);

            let envelope: Envelope<Vec<ZoneEntry>> = self.send(request, "list zones").await?;
            let total_pages = envelope.result_info.as_ref().map_or(0, |info| info.total_pages);
            let current = envelope.result_info.as_ref().map_or(page, |info| info.page.max(page));

            zones.extend(envelope.result.unwrap_or_default().into_iter().map(|zone| zone.id));

            if current >= total_pages {
                break;
            }
            page = current + 1;
        }

        tracing::debug!(zones = zones.len(), "listed zones visible to token");
        Ok(zones)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Factory for creating Cloudflare providers
#[derive(Debug, Clone)]
pub struct CloudflareFactory {
    base_url: String,
}

impl CloudflareFactory {
    pub fn new() -> Self {
        Self {
            base_url: CLOUDFLARE_API_BASE.to_string(),
        }
    }

    /// Build providers against another API root
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for CloudflareFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProviderFactory for CloudflareFactory {
    fn create(&self, credential: &str, timeout: Duration) -> Result<Arc<dyn DnsProvider>> {
        let provider =
            CloudflareProvider::new(credential, timeout)?.with_base_url(self.base_url.clone());
        Ok(Arc::new(provider))
    }
}
