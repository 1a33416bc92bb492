//! HTTP adapters for the provider and discovery ports

pub mod provider;
pub mod discovery;

pub use provider::{is_valid_mint_key, EndpointConfig, HttpProviderClient, HttpProviderConfig};
pub use discovery::{HttpDiscoveryConfig, HttpDiscoverySource};
