//! Butters Scout - cost-aware token discovery and scoring library
//!
//! Discovers candidate tokens, filters them through quick, medium and full
//! scoring gates of increasing data cost, and promotes the survivors. Every
//! provider call goes through a shared cache, batch planner and rate limiter.
//!
//! # Modules
//!
//! - `domain`: Core logic (fields, candidates, cost model, scoring, change detection, scheduling policy)
//! - `ports`: Trait abstractions (ProviderClient, DiscoverySource, AlertSink)
//! - `adapters`: External implementations (rate limiter, cache, HTTP clients, CLI)
//! - `config`: Configuration loading and validation
//! - `application`: Batch orchestrator, pipeline and scheduler loop

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod config;
pub mod application;
