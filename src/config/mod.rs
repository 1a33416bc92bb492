//! Configuration Module
//!
//! Loads and validates configuration from TOML files.

pub mod loader;

pub use loader::{
    load_config, AlertsSection, CacheSection, ChangeSection, Config, ConfigError,
    DiscoverySection, LoggingSection, OrchestratorSection, PersistenceSection, ProviderSection,
};
