// # cfdns-core
//
// Core library for the cfdns dynamic DNS reconciler.
//
// ## Architecture Overview
//
// This library keeps a set of hostnames pointed at the host's public
// address(es):
// - **IpSource**: Trait for resolving the current public address per family
// - **DnsProvider**: Trait for the record calls a DNS provider must offer
// - **WorkerPool**: Bounded, cancellable executor for every network call
// - **ConfigStore**: Hot-swappable generation of config + client + pool
// - **ReconciliationEngine**: Resolve, diff and apply, one cycle at a time
// - **ConfigWatcher**: Metadata poller that signals configuration edits
// - **Driver**: Timer / change / cancellation loop around the engine
//
// ## Design Principles
//
// 1. **Library-First**: The daemon is a thin shell over this crate
// 2. **Capabilities, not policy**: Providers and IP sources only make calls;
//    the engine decides what to change
// 3. **Cycle consistency**: A cycle runs against one captured generation
// 4. **Cooperative cancellation**: One root token reaches every call

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod pool;
pub mod store;
pub mod traits;
pub mod watcher;

// Re-export core types for convenience
pub use config::{Config, Domain};
pub use driver::Driver;
pub use engine::{CycleReport, ReconciliationEngine, ResolvedAddresses, UpdateResult};
pub use error::{Error, Result};
pub use pool::{TaskHandle, WorkerPool};
pub use store::{ConfigStore, Generation};
pub use traits::{DnsProvider, DnsProviderFactory, DnsRecord, IpSource, IpVersion, RecordType};
pub use watcher::{ChangeSignal, ConfigWatcher, FileSignature};
