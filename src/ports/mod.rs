//! Ports Layer - Trait definitions for external collaborators
//!
//! Following hexagonal architecture, these traits abstract:
//! - Token discovery feeds
//! - Rate-limited, cost-metered field providers
//! - Alert delivery for promoted tokens

pub mod provider;
pub mod discovery;
pub mod alerts;
pub mod mocks;

pub use provider::{BatchResponse, KeyError, KeyResult, ProviderClient, ProviderError};
pub use discovery::{DiscoveryError, DiscoveryFilter, DiscoverySource};
pub use alerts::{AlertError, AlertSink};
