//! Composite Scoring Engine
//!
//! Weighted sum of named factors, each normalized to [0, 100]:
//!
//! ```text
//! composite = clamp(Σ wᵢ·norm(factorᵢ) / Σ wᵢ + Σ adjustments, 0, 100)
//! ```
//!
//! Every factor declares the gate whose data it needs. A stage score only
//! uses the factors available at that gate, renormalized by their weights, so
//! the quick gate never waits on a fetch. At the full gate every factor
//! participates and `Σ wᵢ` equals the configured weight total.
//!
//! The engine is pure: the same fields and registry snapshot always produce the
//! same result.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

use super::activity::{detect_activity, ActivityThresholds};
use super::candidate::{Candidate, Gate};
use super::fields::FieldBag;
use super::registry::{EntityTag, RegistrySnapshot};

/// Tolerance when checking weights against the configured total
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("Unknown scoring factor: {0}")]
    UnknownFactor(String),
    #[error("Scoring factor listed twice: {0}")]
    DuplicateFactor(String),
    #[error("Factor {name} has invalid weight {weight}")]
    InvalidWeight { name: String, weight: f64 },
    #[error("Factor weights sum to {sum}, expected {total}")]
    WeightTotalMismatch { sum: f64, total: f64 },
    #[error("Factor {name} has an invalid normalization range")]
    InvalidScale { name: String },
    #[error("Grade bands must be descending within [0, 100]")]
    InvalidGradeBands,
}

/// Maps a raw factor value onto [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scale", rename_all = "snake_case")]
pub enum Normalizer {
    Linear { min: f64, max: f64 },
    /// Logarithmic between two positive bounds, for values spanning decades
    Log10 { min: f64, max: f64 },
    /// Already a 0-100 value
    Percent,
}

impl Normalizer {
    pub fn apply(&self, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        let scaled = match *self {
            Normalizer::Linear { min, max } => (raw - min) / (max - min) * 100.0,
            Normalizer::Log10 { min, max } => {
                if raw <= 0.0 {
                    return 0.0;
                }
                (raw.log10() - min.log10()) / (max.log10() - min.log10()) * 100.0
            }
            Normalizer::Percent => raw,
        };
        scaled.clamp(0.0, 100.0)
    }

    fn is_valid(&self) -> bool {
        match *self {
            Normalizer::Linear { min, max } => min.is_finite() && max.is_finite() && max > min,
            Normalizer::Log10 { min, max } => min > 0.0 && max.is_finite() && max > min,
            Normalizer::Percent => true,
        }
    }
}

/// A named, self-describing score input.
pub trait Factor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Earliest gate whose data this factor can be computed from
    fn gate(&self) -> Gate;

    /// Raw value, or `None` when the inputs are missing
    fn raw(&self, fields: &FieldBag) -> Option<f64>;

    fn default_scale(&self) -> Normalizer;
}

#[derive(Debug)]
struct LiquidityFactor;

impl Factor for LiquidityFactor {
    fn name(&self) -> &str {
        "liquidity"
    }
    fn gate(&self) -> Gate {
        Gate::Quick
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        fields.quick.liquidity_usd
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Log10 {
            min: 10_000.0,
            max: 10_000_000.0,
        }
    }
}

#[derive(Debug)]
struct VolumeFactor;

impl Factor for VolumeFactor {
    fn name(&self) -> &str {
        "volume"
    }
    fn gate(&self) -> Gate {
        Gate::Quick
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        fields.volume_24h()
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Log10 {
            min: 10_000.0,
            max: 100_000_000.0,
        }
    }
}

#[derive(Debug)]
struct MarketCapFactor;

impl Factor for MarketCapFactor {
    fn name(&self) -> &str {
        "market_cap"
    }
    fn gate(&self) -> Gate {
        Gate::Quick
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        fields.quick.market_cap
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Log10 {
            min: 50_000.0,
            max: 100_000_000.0,
        }
    }
}

#[derive(Debug)]
struct MomentumFactor;

impl Factor for MomentumFactor {
    fn name(&self) -> &str {
        "momentum"
    }
    fn gate(&self) -> Gate {
        Gate::Quick
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        fields.price_change_24h()
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Linear {
            min: -50.0,
            max: 150.0,
        }
    }
}

#[derive(Debug)]
struct BuyPressureFactor;

impl Factor for BuyPressureFactor {
    fn name(&self) -> &str {
        "buy_pressure"
    }
    fn gate(&self) -> Gate {
        Gate::Medium
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        let volume = fields.volume.as_ref()?;
        let (buys, sells) = (volume.buys_1h?, volume.sells_1h?);
        let total = buys + sells;
        if total == 0 {
            return None;
        }
        Some(buys as f64 / total as f64 * 100.0)
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Linear {
            min: 30.0,
            max: 80.0,
        }
    }
}

#[derive(Debug)]
struct ActivityFactor {
    thresholds: ActivityThresholds,
}

impl Factor for ActivityFactor {
    fn name(&self) -> &str {
        "activity"
    }
    fn gate(&self) -> Gate {
        Gate::Medium
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        fields.volume.as_ref()?;
        let points = detect_activity(fields, &self.thresholds)
            .iter()
            .map(|signal| signal.points())
            .sum();
        Some(points)
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Percent
    }
}

#[derive(Debug)]
struct HolderDistributionFactor;

impl Factor for HolderDistributionFactor {
    fn name(&self) -> &str {
        "holder_distribution"
    }
    fn gate(&self) -> Gate {
        Gate::Full
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        let holders = fields.holders.as_ref()?;
        let spread = holders.top10_holder_pct.map(|pct| (100.0 - pct).clamp(0.0, 100.0));
        let breadth = holders.holder_count.map(|count| {
            Normalizer::Log10 {
                min: 100.0,
                max: 10_000.0,
            }
            .apply(count as f64)
        });
        match (spread, breadth) {
            (Some(s), Some(b)) => Some(0.7 * s + 0.3 * b),
            (Some(s), None) => Some(s),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Percent
    }
}

#[derive(Debug)]
struct SecurityFactor;

impl Factor for SecurityFactor {
    fn name(&self) -> &str {
        "security"
    }
    fn gate(&self) -> Gate {
        Gate::Full
    }
    fn raw(&self, fields: &FieldBag) -> Option<f64> {
        let sec = fields.security.as_ref()?;
        if sec.is_honeypot == Some(true) {
            return Some(0.0);
        }
        let checks = [
            sec.mint_authority_revoked.map(|r| if r { 30.0 } else { 0.0 }),
            sec.freeze_authority_revoked.map(|r| if r { 30.0 } else { 0.0 }),
            sec.lp_burned_pct.map(|pct| (pct * 0.3).clamp(0.0, 30.0)),
            sec.is_mutable.map(|m| if m { 0.0 } else { 10.0 }),
        ];
        if checks.iter().all(Option::is_none) {
            return None;
        }
        Some(checks.iter().flatten().sum())
    }
    fn default_scale(&self) -> Normalizer {
        Normalizer::Percent
    }
}

/// Instantiate a built-in factor by its configured name.
pub fn builtin_factor(name: &str, activity: &ActivityThresholds) -> Option<Box<dyn Factor>> {
    let factor: Box<dyn Factor> = match name {
        "liquidity" => Box::new(LiquidityFactor),
        "volume" => Box::new(VolumeFactor),
        "market_cap" => Box::new(MarketCapFactor),
        "momentum" => Box::new(MomentumFactor),
        "buy_pressure" => Box::new(BuyPressureFactor),
        "activity" => Box::new(ActivityFactor {
            thresholds: activity.clone(),
        }),
        "holder_distribution" => Box::new(HolderDistributionFactor),
        "security" => Box::new(SecurityFactor),
        _ => return None,
    };
    Some(factor)
}

/// Discrete bonus or penalty added after the weighted sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AdjustmentRule {
    LpBurned { min_pct: f64, points: f64 },
    AuthoritiesRevoked { points: f64 },
    Honeypot { points: f64 },
    NewListing { max_age_hours: f64, points: f64 },
    /// Key or creator carries `tag` in the known entity registry
    KnownEntity { tag: EntityTag, points: f64 },
}

impl AdjustmentRule {
    pub fn name(&self) -> &'static str {
        match self {
            AdjustmentRule::LpBurned { .. } => "lp_burned",
            AdjustmentRule::AuthoritiesRevoked { .. } => "authorities_revoked",
            AdjustmentRule::Honeypot { .. } => "honeypot",
            AdjustmentRule::NewListing { .. } => "new_listing",
            AdjustmentRule::KnownEntity { .. } => "known_entity",
        }
    }

    pub fn gate(&self) -> Gate {
        match self {
            AdjustmentRule::NewListing { .. } | AdjustmentRule::KnownEntity { .. } => Gate::Quick,
            _ => Gate::Full,
        }
    }

    /// Points this rule contributes, if it fires.
    fn evaluate(&self, key: &str, fields: &FieldBag, registry: &RegistrySnapshot) -> Option<f64> {
        let security = fields.security.as_ref();
        let fired = match self {
            AdjustmentRule::LpBurned { min_pct, .. } => security
                .and_then(|s| s.lp_burned_pct)
                .map_or(false, |pct| pct >= *min_pct),
            AdjustmentRule::AuthoritiesRevoked { .. } => {
                security.map_or(false, |s| s.authorities_revoked())
            }
            AdjustmentRule::Honeypot { .. } => {
                security.map_or(false, |s| s.is_honeypot == Some(true))
            }
            AdjustmentRule::NewListing { max_age_hours, .. } => fields
                .quick
                .age_hours
                .map_or(false, |age| age <= *max_age_hours),
            AdjustmentRule::KnownEntity { tag, .. } => {
                registry.has_tag(key, *tag)
                    || fields
                        .metadata
                        .as_ref()
                        .and_then(|m| m.creator.as_deref())
                        .map_or(false, |creator| registry.has_tag(creator, *tag))
            }
        };
        fired.then(|| self.points())
    }

    fn points(&self) -> f64 {
        match self {
            AdjustmentRule::LpBurned { points, .. }
            | AdjustmentRule::AuthoritiesRevoked { points }
            | AdjustmentRule::Honeypot { points }
            | AdjustmentRule::NewListing { points, .. }
            | AdjustmentRule::KnownEntity { points, .. } => *points,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

/// Lower bound of each grade; below `d` is an F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeBands {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeBands {
    fn default() -> Self {
        Self {
            a: 85.0,
            b: 70.0,
            c: 55.0,
            d: 40.0,
        }
    }
}

impl GradeBands {
    pub fn grade(&self, score: f64) -> Grade {
        if score >= self.a {
            Grade::A
        } else if score >= self.b {
            Grade::B
        } else if score >= self.c {
            Grade::C
        } else if score >= self.d {
            Grade::D
        } else {
            Grade::F
        }
    }

    fn is_valid(&self) -> bool {
        self.a <= 100.0 && self.a > self.b && self.b > self.c && self.c > self.d && self.d >= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorWeight {
    pub name: String,
    pub weight: f64,
    /// Overrides the factor's built-in normalization range
    #[serde(default)]
    pub scale: Option<Normalizer>,
}

impl FactorWeight {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            scale: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_weight_total")]
    pub weight_total: f64,
    pub factors: Vec<FactorWeight>,
    #[serde(default)]
    pub adjustments: Vec<AdjustmentRule>,
    #[serde(default)]
    pub grades: GradeBands,
    #[serde(default)]
    pub activity: ActivityThresholds,
}

fn default_weight_total() -> f64 {
    1.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weight_total: 1.0,
            factors: vec![
                FactorWeight::new("liquidity", 0.20),
                FactorWeight::new("volume", 0.15),
                FactorWeight::new("market_cap", 0.10),
                FactorWeight::new("momentum", 0.10),
                FactorWeight::new("buy_pressure", 0.10),
                FactorWeight::new("activity", 0.10),
                FactorWeight::new("holder_distribution", 0.10),
                FactorWeight::new("security", 0.15),
            ],
            adjustments: vec![
                AdjustmentRule::LpBurned {
                    min_pct: 90.0,
                    points: 5.0,
                },
                AdjustmentRule::AuthoritiesRevoked { points: 5.0 },
                AdjustmentRule::Honeypot { points: -50.0 },
                AdjustmentRule::NewListing {
                    max_age_hours: 24.0,
                    points: 3.0,
                },
                AdjustmentRule::KnownEntity {
                    tag: EntityTag::SerialRugger,
                    points: -40.0,
                },
                AdjustmentRule::KnownEntity {
                    tag: EntityTag::TrustedDeployer,
                    points: 5.0,
                },
            ],
            grades: GradeBands::default(),
            activity: ActivityThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub name: String,
    pub gate: Gate,
    pub weight: f64,
    pub raw: Option<f64>,
    pub normalized: f64,
    /// Share of the stage score this factor accounts for
    pub contribution: f64,
    pub missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub rule: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageScore {
    pub gate: Gate,
    pub score: f64,
    pub weighted: f64,
    pub breakdown: Vec<FactorContribution>,
    pub adjustments: Vec<AppliedAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub candidate_key: String,
    pub symbol: Option<String>,
    pub stage_scores: BTreeMap<Gate, f64>,
    pub composite_score: f64,
    pub factor_breakdown: Vec<FactorContribution>,
    pub adjustments: Vec<AppliedAdjustment>,
    pub grade: Grade,
    pub registry_version: u64,
}

#[derive(Debug)]
struct WeightedFactor {
    factor: Box<dyn Factor>,
    weight: f64,
    scale: Normalizer,
}

#[derive(Debug)]
pub struct ScoringEngine {
    factors: Vec<WeightedFactor>,
    adjustments: Vec<AdjustmentRule>,
    grades: GradeBands,
    weight_total: f64,
}

impl ScoringEngine {
    /// Build an engine from explicit factors. Fails when weights do not sum
    /// to `weight_total`.
    pub fn new(
        weight_total: f64,
        factors: Vec<(Box<dyn Factor>, f64, Option<Normalizer>)>,
        adjustments: Vec<AdjustmentRule>,
        grades: GradeBands,
    ) -> Result<Self, ScoringError> {
        let mut names = HashSet::new();
        let mut weighted = Vec::with_capacity(factors.len());
        for (factor, weight, scale) in factors {
            let name = factor.name().to_string();
            if !names.insert(name.clone()) {
                return Err(ScoringError::DuplicateFactor(name));
            }
            if !weight.is_finite() || weight < 0.0 {
                return Err(ScoringError::InvalidWeight { name, weight });
            }
            let scale = scale.unwrap_or_else(|| factor.default_scale());
            if !scale.is_valid() {
                return Err(ScoringError::InvalidScale { name });
            }
            weighted.push(WeightedFactor {
                factor,
                weight,
                scale,
            });
        }

        let sum: f64 = weighted.iter().map(|f| f.weight).sum();
        if weight_total <= 0.0 || (sum - weight_total).abs() > WEIGHT_TOLERANCE {
            return Err(ScoringError::WeightTotalMismatch {
                sum,
                total: weight_total,
            });
        }
        if !grades.is_valid() {
            return Err(ScoringError::InvalidGradeBands);
        }

        Ok(Self {
            factors: weighted,
            adjustments,
            grades,
            weight_total,
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self, ScoringError> {
        let factors = config
            .factors
            .iter()
            .map(|fw| {
                builtin_factor(&fw.name, &config.activity)
                    .map(|factor| (factor, fw.weight, fw.scale))
                    .ok_or_else(|| ScoringError::UnknownFactor(fw.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(
            config.weight_total,
            factors,
            config.adjustments.clone(),
            config.grades,
        )
    }

    pub fn weight_total(&self) -> f64 {
        self.weight_total
    }

    pub fn grades(&self) -> &GradeBands {
        &self.grades
    }

    /// Score with every factor and adjustment available at `gate`.
    pub fn score_stage(
        &self,
        gate: Gate,
        key: &str,
        fields: &FieldBag,
        registry: &RegistrySnapshot,
    ) -> StageScore {
        let active: Vec<&WeightedFactor> =
            self.factors.iter().filter(|f| f.factor.gate() <= gate).collect();
        let weight_sum: f64 = active.iter().map(|f| f.weight).sum();

        let breakdown: Vec<FactorContribution> = active
            .iter()
            .map(|wf| {
                let raw = wf.factor.raw(fields);
                let normalized = raw.map_or(0.0, |r| wf.scale.apply(r));
                let contribution = if weight_sum > 0.0 {
                    wf.weight * normalized / weight_sum
                } else {
                    0.0
                };
                FactorContribution {
                    name: wf.factor.name().to_string(),
                    gate: wf.factor.gate(),
                    weight: wf.weight,
                    raw,
                    normalized,
                    contribution,
                    missing: raw.is_none(),
                }
            })
            .collect();
        let weighted: f64 = breakdown.iter().map(|c| c.contribution).sum();

        let adjustments: Vec<AppliedAdjustment> = self
            .adjustments
            .iter()
            .filter(|rule| rule.gate() <= gate)
            .filter_map(|rule| {
                rule.evaluate(key, fields, registry)
                    .map(|points| AppliedAdjustment {
                        rule: rule.name().to_string(),
                        points,
                    })
            })
            .collect();
        let bonus: f64 = adjustments.iter().map(|a| a.points).sum();

        StageScore {
            gate,
            score: (weighted + bonus).clamp(0.0, 100.0),
            weighted,
            breakdown,
            adjustments,
        }
    }

    /// Final composite over every factor, with the candidate's earlier gate scores.
    pub fn finalize(&self, candidate: &Candidate, registry: &RegistrySnapshot) -> ScoreResult {
        let full = self.score_stage(Gate::Full, &candidate.key, &candidate.fields, registry);
        let mut stage_scores = candidate.stage_scores.clone();
        stage_scores.insert(Gate::Full, full.score);
        ScoreResult {
            candidate_key: candidate.key.clone(),
            symbol: candidate.symbol.clone(),
            stage_scores,
            composite_score: full.score,
            grade: self.grades.grade(full.score),
            factor_breakdown: full.breakdown,
            adjustments: full.adjustments,
            registry_version: registry.version(),
        }
    }
}
