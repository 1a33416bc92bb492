//! Trading Activity Signals
//!
//! One classifier for every kind of on-chain activity worth noticing. Each
//! detected signal is an `ActivityType` variant carrying its own evidence, and
//! the activity factor simply sums their points.

use serde::{Deserialize, Serialize};

use super::fields::FieldBag;

/// Detection thresholds for activity signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityThresholds {
    /// Hourly volume, annualized to 24h, over the 24h volume
    pub volume_spike_ratio: f64,
    /// buys / (buys + sells) over the last hour
    pub buy_pressure_ratio: f64,
    /// Percent change in unique wallets over 24h
    pub wallet_growth_pct: f64,
    /// Single trade size in USD
    pub whale_trade_usd: f64,
}

impl Default for ActivityThresholds {
    fn default() -> Self {
        Self {
            volume_spike_ratio: 1.5,
            buy_pressure_ratio: 0.55,
            wallet_growth_pct: 10.0,
            whale_trade_usd: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityType {
    VolumeSpike { ratio: f64 },
    BuyPressure { buy_ratio: f64 },
    WalletGrowth { change_pct: f64 },
    WhaleTrade { trade_usd: f64 },
}

impl ActivityType {
    /// Contribution to the activity factor, 0-40 per signal
    pub fn points(&self) -> f64 {
        match self {
            ActivityType::VolumeSpike { ratio } => 40.0 * (ratio / 3.0).min(1.0),
            ActivityType::BuyPressure { buy_ratio } => {
                30.0 * ((buy_ratio - 0.5) / 0.3).clamp(0.0, 1.0)
            }
            ActivityType::WalletGrowth { change_pct } => 30.0 * (change_pct / 100.0).min(1.0),
            ActivityType::WhaleTrade { .. } => 10.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActivityType::VolumeSpike { .. } => "volume_spike",
            ActivityType::BuyPressure { .. } => "buy_pressure",
            ActivityType::WalletGrowth { .. } => "wallet_growth",
            ActivityType::WhaleTrade { .. } => "whale_trade",
        }
    }
}

/// Classify the activity visible in `fields`. Needs the volume category.
pub fn detect_activity(fields: &FieldBag, thresholds: &ActivityThresholds) -> Vec<ActivityType> {
    let Some(volume) = fields.volume.as_ref() else {
        return Vec::new();
    };
    let mut signals = Vec::new();

    if let (Some(v1h), Some(v24h)) = (volume.volume_1h, fields.volume_24h()) {
        if v24h > 0.0 {
            let ratio = v1h * 24.0 / v24h;
            if ratio >= thresholds.volume_spike_ratio {
                signals.push(ActivityType::VolumeSpike { ratio });
            }
        }
    }

    if let (Some(buys), Some(sells)) = (volume.buys_1h, volume.sells_1h) {
        let total = buys + sells;
        if total > 0 {
            let buy_ratio = buys as f64 / total as f64;
            if buy_ratio >= thresholds.buy_pressure_ratio {
                signals.push(ActivityType::BuyPressure { buy_ratio });
            }
        }
    }

    if let Some(change_pct) = volume.wallet_change_24h_pct {
        if change_pct >= thresholds.wallet_growth_pct {
            signals.push(ActivityType::WalletGrowth { change_pct });
        }
    }

    if let Some(trade_usd) = volume.largest_trade_usd_1h {
        if trade_usd >= thresholds.whale_trade_usd {
            signals.push(ActivityType::WhaleTrade { trade_usd });
        }
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fields::{QuickFields, VolumeFields};

    fn bag(volume: VolumeFields) -> FieldBag {
        let mut bag = FieldBag::new(QuickFields::default());
        bag.volume = Some(volume);
        bag
    }

    #[test]
    fn test_no_volume_data_no_signals() {
        let bag = FieldBag::new(QuickFields::default());
        assert!(detect_activity(&bag, &ActivityThresholds::default()).is_empty());
    }

    #[test]
    fn test_detects_every_signal() {
        let fields = bag(VolumeFields {
            volume_1h: Some(30_000.0),
            volume_24h: Some(240_000.0),
            buys_1h: Some(80),
            sells_1h: Some(20),
            wallet_change_24h_pct: Some(50.0),
            largest_trade_usd_1h: Some(25_000.0),
            ..Default::default()
        });
        let signals = detect_activity(&fields, &ActivityThresholds::default());
        let labels: Vec<&str> = signals.iter().map(|s| s.label()).collect();
        assert_eq!(
            labels,
            vec!["volume_spike", "buy_pressure", "wallet_growth", "whale_trade"]
        );
        let total: f64 = signals.iter().map(|s| s.points()).sum();
        assert!(total > 60.0 && total <= 110.0);
    }

    #[test]
    fn test_quiet_token_has_no_signals() {
        let fields = bag(VolumeFields {
            volume_1h: Some(1_000.0),
            volume_24h: Some(240_000.0),
            buys_1h: Some(10),
            sells_1h: Some(12),
            ..Default::default()
        });
        assert!(detect_activity(&fields, &ActivityThresholds::default()).is_empty());
    }

    #[test]
    fn test_points_are_capped() {
        assert_eq!(ActivityType::VolumeSpike { ratio: 100.0 }.points(), 40.0);
        assert_eq!(ActivityType::BuyPressure { buy_ratio: 1.0 }.points(), 30.0);
        assert_eq!(ActivityType::WalletGrowth { change_pct: 900.0 }.points(), 30.0);
    }
}
