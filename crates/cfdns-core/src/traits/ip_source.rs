// # IP Source Trait
//
// Defines the interface for discovering this host's public address.
//
// ## Implementations
//
// - HTTP address-echo services: `cfdns-ip-http` crate
//
// ## Usage
//
// ```rust,ignore
// use cfdns_core::traits::{IpSource, IpVersion};
// use tokio_util::sync::CancellationToken;
//
// let source = /* IpSource implementation */;
// let cancel = CancellationToken::new();
// let ip = source.resolve(IpVersion::V4, &cancel).await?;
// ```

use crate::traits::dns_provider::RecordType;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;

/// IP version (v4 or v6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// DNS record type carrying addresses of this family
    pub fn record_type(self) -> RecordType {
        match self {
            IpVersion::V4 => RecordType::A,
            IpVersion::V6 => RecordType::Aaaa,
        }
    }

    /// Whether `ip` belongs to this family
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            IpVersion::V4 => ip.is_ipv4(),
            IpVersion::V6 => ip.is_ipv6(),
        }
    }

    /// Short lowercase label used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4",
            IpVersion::V6 => "ipv6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for public IP resolvers
///
/// # Cancellation
///
/// Implementations must return [`Error::Cancelled`](crate::Error::Cancelled)
/// promptly once `cancel` fires, without trying further services. The
/// caller's cancellation always wins over fallback.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait IpSource: Send + Sync {
    /// Resolve the current public address of the given family
    ///
    /// # Returns
    ///
    /// - `Ok(IpAddr)`: A canonical address of the requested family
    /// - `Err(Error::NoAddressAvailable)`: Every service failed or answered garbage
    /// - `Err(Error::Cancelled)`: `cancel` fired
    async fn resolve(
        &self,
        version: IpVersion,
        cancel: &CancellationToken,
    ) -> Result<IpAddr, crate::Error>;
}
