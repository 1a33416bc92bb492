//! Domain Layer - Core logic for the Butters token scout
//!
//! Pure types and policies with no I/O beyond snapshot files.
//! All provider interactions happen through the ports layer.
//!
//! - `fields`: Typed field categories decoded leniently from provider JSON
//! - `candidate`: Candidate tokens and the forward-only stage machine
//! - `cost_model`: Sub-linear batch cost and batch packing
//! - `change_detector`: Per-token snapshots and the cross-cycle state cache
//! - `activity`: Trading activity classification
//! - `registry`: Versioned known-entity registry
//! - `scoring`: Weighted factor scoring, adjustments and grades
//! - `scheduler`: Adaptive polling interval policy
//! - `persistence`: Atomic snapshot files

pub mod fields;
pub mod candidate;
pub mod cost_model;
pub mod change_detector;
pub mod activity;
pub mod registry;
pub mod scoring;
pub mod scheduler;
pub mod persistence;

pub use fields::{
    FieldBag, FieldCategory, FieldRecord, HolderFields, MetadataFields, PriceFields,
    QuickFields, SecurityFields, VolumeFields,
};
pub use candidate::{Candidate, CandidateSeed, Elimination, EliminationReason, Gate, Stage, StageError};
pub use cost_model::{
    estimate_savings, pack_partition, plan_batches, BatchRequest, EndpointCost, PartitionKey,
    SavingsEstimate,
};
pub use change_detector::{
    AnalysisOutcome, ChangeDetector, ChangeVerdict, CommitSummary, FieldSnapshot, StateCache,
};
pub use activity::{detect_activity, ActivityThresholds, ActivityType};
pub use registry::{EntityEntry, EntityTag, KnownEntityRegistry, RegistryError, RegistrySnapshot};
pub use scoring::{
    AdjustmentRule, FactorContribution, FactorWeight, Grade, GradeBands, Normalizer,
    ScoreResult, ScoringConfig, ScoringEngine, ScoringError, StageScore,
};
pub use scheduler::{CycleSignals, IntervalDecision, SchedulerConfig, SchedulerState};
pub use persistence::{PersistError, RecoveryStatus, SnapshotStore};
