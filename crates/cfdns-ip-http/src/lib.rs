// # HTTP IP Source
//
// This crate resolves the host's public address by asking plain-text
// address-echo services (ipify, icanhazip, ident.me).
//
// ## Architecture
//
// Each family has its own service list. A resolution shuffles that list and
// tries the services in order:
// - non-success status, transport error or unparsable body: skip to the next
// - an address of the wrong family: skip to the next
// - the caller's cancellation token fires: stop immediately
// - every service exhausted: `Error::NoAddressAvailable`
//
// Bodies are read up to a small fixed limit; these services answer with a
// single address literal.

use cfdns_core::traits::{IpSource, IpVersion};
use cfdns_core::{Error, Result};

use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Services echoing the caller's IPv4 address
pub const IPV4_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
    "https://v4.ident.me",
];

/// Services echoing the caller's IPv6 address
pub const IPV6_SERVICES: &[&str] = &[
    "https://api6.ipify.org",
    "https://ipv6.icanhazip.com",
    "https://v6.ident.me",
];

/// Deadline of a single service request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes read from a response body at most
pub const MAX_BODY_BYTES: usize = 128;

/// Public address resolver backed by HTTP echo services
pub struct HttpIpSource {
    ipv4_services: Vec<String>,
    ipv6_services: Vec<String>,
    shuffle: bool,
    client: reqwest::Client,
}

impl HttpIpSource {
    /// Create a resolver with the default services and request timeout
    pub fn new() -> Self {
        Self {
            ipv4_services: IPV4_SERVICES.iter().map(|s| s.to_string()).collect(),
            ipv6_services: IPV6_SERVICES.iter().map(|s| s.to_string()).collect(),
            shuffle: true,
            client: build_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Replace the service list of one family
    pub fn with_services(mut self, version: IpVersion, services: Vec<String>) -> Self {
        match version {
            IpVersion::V4 => self.ipv4_services = services,
            IpVersion::V6 => self.ipv6_services = services,
        }
        self
    }

    /// Try services in list order instead of a random order
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Change the deadline of a single service request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    /// Services for `version` in the order they will be tried
    fn services(&self, version: IpVersion) -> Vec<&str> {
        let list = match version {
            IpVersion::V4 => &self.ipv4_services,
            IpVersion::V6 => &self.ipv6_services,
        };
        let mut order: Vec<&str> = list.iter().map(String::as_str).collect();
        if self.shuffle {
            order.shuffle(&mut rand::rng());
        }
        order
    }

    /// Fetch the trimmed, size-limited body of `url`
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::http(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::http(format!("unexpected status code: {}", response.status())));
        }

        let mut body = Vec::with_capacity(MAX_BODY_BYTES);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::http(format!("failed to read response: {}", e)))?
        {
            let room = MAX_BODY_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_BODY_BYTES {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }
}

impl Default for HttpIpSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpIpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIpSource")
            .field("ipv4_services", &self.ipv4_services)
            .field("ipv6_services", &self.ipv6_services)
            .field("shuffle", &self.shuffle)
            .finish()
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl IpSource for HttpIpSource {
    async fn resolve(&self, version: IpVersion, cancel: &CancellationToken) -> Result<IpAddr> {
        for service in self.services(version) {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(service, "address resolution cancelled");
                    return Err(Error::Cancelled);
                }
                fetched = self.fetch_text(service) => fetched,
            };

            let text = match fetched {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(
                        service,
                        error = %e,
                        "failed to acquire IP address from service"
                    );
                    continue;
                }
            };

            let ip = match text.parse::<IpAddr>() {
                Ok(ip) => ip.to_canonical(),
                Err(_) => {
                    tracing::warn!(service, body = %text, "service returned an invalid IP address");
                    continue;
                }
            };

            if !version.matches(&ip) {
                tracing::warn!(
                    service,
                    address = %ip,
                    family = %version,
                    "service returned an address of the wrong family"
                );
                continue;
            }

            tracing::debug!(service, address = %ip, "resolved public address");
            return Ok(ip);
        }

        Err(Error::NoAddressAvailable(version.as_str()))
    }
}
