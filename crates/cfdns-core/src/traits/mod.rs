//! Collaborator traits for cfdns
//!
//! The engine only talks to the outside world through these interfaces.
//!
//! - [`IpSource`]: Resolve the current public address for a family
//! - [`DnsProvider`]: List, create and update records, list zones
//! - [`DnsProviderFactory`]: Build a credentialed provider client

pub mod ip_source;
pub mod dns_provider;

pub use ip_source::{IpSource, IpVersion};
pub use dns_provider::{DnsProvider, DnsProviderFactory, DnsRecord, RecordType};
