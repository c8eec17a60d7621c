//! Configuration types for cfdns
//!
//! A [`Config`] is loaded from a YAML or JSON document, normalised by
//! [`Config::prepare`] and then handed to the
//! [`ConfigStore`](crate::store::ConfigStore). It is never mutated after that:
//! a reload produces a whole new value.

use crate::error::{Error, Result};
use crate::traits::IpVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Polling frequency used when the document leaves it out
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(60 * 60);

/// Lowest accepted polling frequency
pub const MIN_FREQUENCY: Duration = Duration::from_secs(10);

/// Per-call timeout used when the document leaves it out
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest accepted per-call timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker count used when the document leaves it out
pub const DEFAULT_WORKERS: usize = 10;

/// Inclusive bounds for the worker count
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 64;

/// Main cfdns configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Cloudflare zone identifier
    #[serde(default)]
    pub zone_id: String,

    /// Zone-scoped API token (DNS read/write)
    /// ⚠️ NEVER log this value
    #[serde(default)]
    pub token: String,

    /// Interval between reconciliation cycles
    #[serde(default = "default_frequency", with = "duration_text")]
    pub frequency: Duration,

    /// Upper bound for every individual network call
    #[serde(default = "default_timeout", with = "duration_text")]
    pub timeout: Duration,

    /// Worker pool concurrency limit
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Debug-level logging
    #[serde(default)]
    pub verbose: bool,

    /// Manage A records
    #[serde(default)]
    pub ipv4: bool,

    /// Manage AAAA records
    #[serde(default)]
    pub ipv6: bool,

    /// Hostnames to keep pointed at this host
    #[serde(default)]
    pub domains: Vec<Domain>,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("zone_id", &self.zone_id)
            .field("token", &"<REDACTED>")
            .field("frequency", &self.frequency)
            .field("timeout", &self.timeout)
            .field("workers", &self.workers)
            .field("verbose", &self.verbose)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .field("domains", &self.domains)
            .finish()
    }
}

impl Config {
    /// Create a configuration with default timing for the given zone and domains
    pub fn new(zone_id: impl Into<String>, token: impl Into<String>, domains: Vec<Domain>) -> Self {
        Self {
            zone_id: zone_id.into(),
            token: token.into(),
            frequency: DEFAULT_FREQUENCY,
            timeout: DEFAULT_TIMEOUT,
            workers: DEFAULT_WORKERS,
            verbose: false,
            ipv4: false,
            ipv6: false,
            domains,
        }
    }

    /// Enable or disable the address families
    pub fn with_families(mut self, ipv4: bool, ipv6: bool) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self
    }

    /// Set the worker concurrency limit
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load, expand, parse and prepare a configuration file
    ///
    /// The format is chosen by extension: `.yaml`/`.yml` or `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let text = expand_env(&raw);

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let config: Config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&text)?,
            "json" => serde_json::from_str(&text)?,
            other => {
                return Err(Error::config(format!(
                    "unsupported file extension: {:?}",
                    other
                )));
            }
        };

        config.prepare()
    }

    /// Normalise and validate
    ///
    /// Trims strings, applies floors and clamps, enables both families when
    /// neither is requested, and rejects documents that break the invariants.
    pub fn prepare(mut self) -> Result<Self> {
        self.zone_id = self.zone_id.trim().to_string();
        self.token = self.token.trim().to_string();

        if self.frequency.is_zero() {
            self.frequency = DEFAULT_FREQUENCY;
        } else if self.frequency < MIN_FREQUENCY {
            warn!(
                frequency = %humantime::format_duration(self.frequency),
                minimum = %humantime::format_duration(MIN_FREQUENCY),
                "frequency below minimum, raising"
            );
            self.frequency = MIN_FREQUENCY;
        }

        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        } else if self.timeout < MIN_TIMEOUT {
            warn!(
                timeout = %humantime::format_duration(self.timeout),
                minimum = %humantime::format_duration(MIN_TIMEOUT),
                "timeout below minimum, raising"
            );
            self.timeout = MIN_TIMEOUT;
        }

        let clamped = self.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        if clamped != self.workers {
            warn!(requested = self.workers, workers = clamped, "worker count clamped");
            self.workers = clamped;
        }

        // neither family requested means both
        if !self.ipv4 && !self.ipv6 {
            self.ipv4 = true;
            self.ipv6 = true;
        }

        for domain in &mut self.domains {
            domain.hostname = domain.hostname.trim().trim_end_matches('.').to_string();
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.zone_id.trim().is_empty() {
            return Err(Error::config("zone_id cannot be empty"));
        }
        if self.token.trim().is_empty() {
            return Err(Error::config("token cannot be empty"));
        }
        if self.domains.is_empty() {
            return Err(Error::config("domains list cannot be empty"));
        }
        if let Some(pos) = self.domains.iter().position(|d| d.hostname.trim().is_empty()) {
            return Err(Error::config(format!("domain #{} has an empty hostname", pos + 1)));
        }
        if !self.ipv4 && !self.ipv6 {
            return Err(Error::config("at least one of ipv4/ipv6 must be enabled"));
        }
        if self.frequency < MIN_FREQUENCY {
            return Err(Error::config(format!(
                "frequency must be at least {}",
                humantime::format_duration(MIN_FREQUENCY)
            )));
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(Error::config(format!(
                "timeout must be at least {}",
                humantime::format_duration(MIN_TIMEOUT)
            )));
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(Error::config(format!(
                "workers must be between {} and {}",
                MIN_WORKERS, MAX_WORKERS
            )));
        }
        Ok(())
    }

    /// Address families this configuration manages, IPv4 first
    pub fn enabled_versions(&self) -> Vec<IpVersion> {
        let mut versions = Vec::with_capacity(2);
        if self.ipv4 {
            versions.push(IpVersion::V4);
        }
        if self.ipv6 {
            versions.push(IpVersion::V6);
        }
        versions
    }

    /// Whether switching to `other` requires a new credentialed client
    pub fn client_changed(&self, other: &Config) -> bool {
        self.token != other.token || self.timeout != other.timeout
    }

    /// Whether switching to `other` requires a new worker pool
    pub fn pool_changed(&self, other: &Config) -> bool {
        self.workers != other.workers
    }
}

/// A hostname to keep pointed at this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    /// Fully-qualified hostname
    pub hostname: String,

    /// Requested proxy setting; `None` leaves the remote setting alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxied: Option<bool>,
}

impl Domain {
    /// Create a domain entry with an unspecified proxy setting
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            proxied: None,
        }
    }

    /// Request a specific proxy setting
    pub fn with_proxied(mut self, proxied: bool) -> Self {
        self.proxied = Some(proxied);
        self
    }
}

fn default_frequency() -> Duration {
    DEFAULT_FREQUENCY
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Expand `${NAME}` references from the process environment
///
/// Unset variables expand to the empty string. An unterminated `${` is kept
/// verbatim.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Durations as humantime strings (`"90s"`, `"5m"`) or bare seconds
mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
        }
    }
}
