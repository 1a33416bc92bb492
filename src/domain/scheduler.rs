//! Adaptive polling interval
//!
//! Pure interval policy. The async loop in `application::scheduler` feeds it one
//! `CycleSignals` per cycle and sleeps for whatever interval comes back.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Interval before the first cycle has been observed; defaults to the midpoint
    pub initial_interval_secs: Option<f64>,
    /// Consecutive zero-change cycles before easing toward the max interval
    pub quiet_cycles: u32,
    /// Changed fraction of discovered seeds that counts as a hot cycle
    pub hot_fraction: f64,
    /// Fraction of the remaining distance moved per adjustment, in (0, 1]
    pub ease_factor: f64,
    /// Cycles held at the max interval after a rate-limit signal
    pub fail_safe_cycles: u32,
    /// Consecutive failed cycles that also trigger the fail-safe; 0 disables
    pub max_failed_cycles: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30.0,
            max_interval_secs: 600.0,
            initial_interval_secs: None,
            quiet_cycles: 3,
            hot_fraction: 0.25,
            ease_factor: 0.5,
            fail_safe_cycles: 2,
            max_failed_cycles: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_secs)
    }

    fn initial_interval(&self) -> f64 {
        self.initial_interval_secs
            .unwrap_or((self.min_interval_secs + self.max_interval_secs) / 2.0)
    }
}

/// What a finished cycle tells the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleSignals {
    pub discovered: usize,
    /// New or changed seeds that entered the pipeline
    pub changed: usize,
    pub promoted: usize,
    pub rate_limited: bool,
    /// Cycle was skipped (discovery unreachable, etc.)
    pub failed: bool,
}

impl CycleSignals {
    pub fn changed_fraction(&self) -> f64 {
        if self.discovered == 0 {
            0.0
        } else {
            self.changed as f64 / self.discovered as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalDecision {
    FailSafe,
    CycleFailed,
    Hot,
    Quiet,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    current_interval_secs: f64,
    pub consecutive_quiet_cycles: u32,
    pub consecutive_error_cycles: u32,
    fail_safe_remaining: u32,
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            current_interval_secs: config
                .initial_interval()
                .clamp(config.min_interval_secs, config.max_interval_secs),
            consecutive_quiet_cycles: 0,
            consecutive_error_cycles: 0,
            fail_safe_remaining: 0,
        }
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_secs_f64(self.current_interval_secs)
    }

    pub fn in_fail_safe(&self) -> bool {
        self.fail_safe_remaining > 0
    }

    /// Fold one cycle's signals into the state and return why the interval moved.
    pub fn advance(&mut self, signals: &CycleSignals, config: &SchedulerConfig) -> IntervalDecision {
        let decision = self.decide(signals, config);
        self.current_interval_secs = self
            .current_interval_secs
            .clamp(config.min_interval_secs, config.max_interval_secs);
        decision
    }

    fn decide(&mut self, signals: &CycleSignals, config: &SchedulerConfig) -> IntervalDecision {
        // Rate limiting overrides every other signal
        if signals.rate_limited {
            if signals.failed {
                self.consecutive_error_cycles += 1;
            }
            return self.enter_fail_safe(config);
        }
        if self.fail_safe_remaining > 0 {
            self.fail_safe_remaining -= 1;
            self.current_interval_secs = config.max_interval_secs;
            return IntervalDecision::FailSafe;
        }

        if signals.failed {
            self.consecutive_error_cycles += 1;
            if config.max_failed_cycles > 0
                && self.consecutive_error_cycles >= config.max_failed_cycles
            {
                tracing::warn!(
                    failed_cycles = self.consecutive_error_cycles,
                    "Repeated cycle failures, holding at max interval"
                );
                return self.enter_fail_safe(config);
            }
            self.consecutive_quiet_cycles = 0;
            self.ease_toward(config.max_interval_secs, config.ease_factor);
            return IntervalDecision::CycleFailed;
        }
        self.consecutive_error_cycles = 0;

        if signals.promoted > 0 || signals.changed_fraction() >= config.hot_fraction {
            self.consecutive_quiet_cycles = 0;
            self.ease_toward(config.min_interval_secs, config.ease_factor);
            return IntervalDecision::Hot;
        }

        if signals.changed == 0 {
            self.consecutive_quiet_cycles += 1;
            if self.consecutive_quiet_cycles >= config.quiet_cycles {
                self.ease_toward(config.max_interval_secs, config.ease_factor);
                return IntervalDecision::Quiet;
            }
            return IntervalDecision::Hold;
        }

        self.consecutive_quiet_cycles = 0;
        IntervalDecision::Hold
    }

    fn enter_fail_safe(&mut self, config: &SchedulerConfig) -> IntervalDecision {
        self.current_interval_secs = config.max_interval_secs;
        self.fail_safe_remaining = config.fail_safe_cycles.saturating_sub(1);
        self.consecutive_quiet_cycles = 0;
        IntervalDecision::FailSafe
    }

    fn ease_toward(&mut self, target: f64, ease: f64) {
        self.current_interval_secs += (target - self.current_interval_secs) * ease;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            min_interval_secs: 10.0,
            max_interval_secs: 100.0,
            initial_interval_secs: Some(50.0),
            quiet_cycles: 2,
            hot_fraction: 0.5,
            ease_factor: 0.5,
            fail_safe_cycles: 2,
            max_failed_cycles: 3,
        }
    }

    fn quiet() -> CycleSignals {
        CycleSignals {
            discovered: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_promotion_eases_toward_min() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let decision = state.advance(
            &CycleSignals {
                discovered: 10,
                changed: 1,
                promoted: 1,
                ..Default::default()
            },
            &cfg,
        );
        assert_eq!(decision, IntervalDecision::Hot);
        assert_relative_eq!(state.current_interval().as_secs_f64(), 30.0);
    }

    #[test]
    fn test_large_changed_fraction_is_hot() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let signals = CycleSignals {
            discovered: 10,
            changed: 6,
            ..Default::default()
        };
        assert_eq!(state.advance(&signals, &cfg), IntervalDecision::Hot);
    }

    #[test]
    fn test_quiet_cycles_ease_toward_max_after_k() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        assert_eq!(state.advance(&quiet(), &cfg), IntervalDecision::Hold);
        assert_relative_eq!(state.current_interval().as_secs_f64(), 50.0);
        assert_eq!(state.advance(&quiet(), &cfg), IntervalDecision::Quiet);
        assert_relative_eq!(state.current_interval().as_secs_f64(), 75.0);
    }

    #[test]
    fn test_rate_limit_forces_max_despite_promotions() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let signals = CycleSignals {
            discovered: 10,
            changed: 10,
            promoted: 5,
            rate_limited: true,
            failed: false,
        };
        assert_eq!(state.advance(&signals, &cfg), IntervalDecision::FailSafe);
        assert_eq!(state.current_interval(), cfg.max_interval());

        // Held for one more cycle even though it is hot
        let hot = CycleSignals {
            discovered: 10,
            changed: 10,
            promoted: 1,
            ..Default::default()
        };
        assert_eq!(state.advance(&hot, &cfg), IntervalDecision::FailSafe);
        assert_eq!(state.current_interval(), cfg.max_interval());
        assert!(!state.in_fail_safe());

        assert_eq!(state.advance(&hot, &cfg), IntervalDecision::Hot);
        assert!(state.current_interval() < cfg.max_interval());
    }

    #[test]
    fn test_failed_cycle_counts_errors_and_backs_off() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let failed = CycleSignals {
            failed: true,
            ..Default::default()
        };
        assert_eq!(state.advance(&failed, &cfg), IntervalDecision::CycleFailed);
        assert_eq!(state.advance(&failed, &cfg), IntervalDecision::CycleFailed);
        assert_eq!(state.consecutive_error_cycles, 2);
        assert!(state.current_interval().as_secs_f64() > 50.0);

        state.advance(&quiet(), &cfg);
        assert_eq!(state.consecutive_error_cycles, 0);
    }

    #[test]
    fn test_repeated_failures_enter_fail_safe() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let failed = CycleSignals {
            failed: true,
            ..Default::default()
        };
        state.advance(&failed, &cfg);
        state.advance(&failed, &cfg);
        assert!(state.current_interval() < cfg.max_interval());

        assert_eq!(state.advance(&failed, &cfg), IntervalDecision::FailSafe);
        assert_eq!(state.current_interval(), cfg.max_interval());
        assert!(state.in_fail_safe());

        // Recovery is held at the max for the remaining fail-safe cycle
        let hot = CycleSignals {
            discovered: 10,
            changed: 10,
            promoted: 1,
            ..Default::default()
        };
        assert_eq!(state.advance(&hot, &cfg), IntervalDecision::FailSafe);
        assert_eq!(state.advance(&hot, &cfg), IntervalDecision::Hot);
    }

    #[test]
    fn test_failure_fail_safe_can_be_disabled() {
        let cfg = SchedulerConfig {
            max_failed_cycles: 0,
            ..config()
        };
        let mut state = SchedulerState::new(&cfg);
        let failed = CycleSignals {
            failed: true,
            ..Default::default()
        };
        for _ in 0..10 {
            assert_eq!(state.advance(&failed, &cfg), IntervalDecision::CycleFailed);
        }
        assert!(!state.in_fail_safe());
    }

    #[test]
    fn test_interval_stays_within_bounds() {
        let cfg = config();
        let mut state = SchedulerState::new(&cfg);
        let hot = CycleSignals {
            discovered: 1,
            changed: 1,
            promoted: 1,
            ..Default::default()
        };
        for _ in 0..50 {
            state.advance(&hot, &cfg);
            assert!(state.current_interval() >= cfg.min_interval());
        }
        for _ in 0..50 {
            state.advance(&quiet(), &cfg);
            assert!(state.current_interval() <= cfg.max_interval());
        }
    }

    #[test]
    fn test_initial_interval_defaults_to_midpoint() {
        let cfg = SchedulerConfig {
            initial_interval_secs: None,
            ..config()
        };
        assert_relative_eq!(
            SchedulerState::new(&cfg).current_interval().as_secs_f64(),
            55.0
        );
    }
}
