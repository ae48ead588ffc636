// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Degradation Policy
//!
//! Turns the stream of per-run routing outcomes into an escalation decision.
//! State is kept per run and never shared between runs.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::node_config::DegradationConfig;
use crate::domain::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradationThresholds {
    pub degraded_after_failures: u32,
    pub stop_after_failures: u32,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            degraded_after_failures: 2,
            stop_after_failures: 5,
        }
    }
}

impl From<&DegradationConfig> for DegradationThresholds {
    fn from(config: &DegradationConfig) -> Self {
        Self {
            degraded_after_failures: config.degraded_after_failures.max(1),
            stop_after_failures: config
                .stop_after_failures
                .max(config.degraded_after_failures.max(1)),
        }
    }
}

/// Escalation decided for a single routing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTransition {
    None,
    Degraded,
    Stop,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunDegradationState {
    consecutive_failures: u32,
    degraded: bool,
}

pub struct DegradationPolicy {
    thresholds: DegradationThresholds,
    runs: Mutex<HashMap<RunId, RunDegradationState>>,
}

impl DegradationPolicy {
    pub fn new(thresholds: DegradationThresholds) -> Self {
        Self {
            thresholds,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> DegradationThresholds {
        self.thresholds
    }

    /// Reset the consecutive-failure counter and re-arm the degraded crossing.
    pub fn record_route_success(&self, run_id: RunId, is_coordinator_target: bool) {
        let mut runs = self.runs.lock();
        if let Some(state) = runs.get_mut(&run_id) {
            if state.consecutive_failures > 0 {
                tracing::debug!(
                    run_id = %run_id,
                    coordinator = is_coordinator_target,
                    failures = state.consecutive_failures,
                    "Route recovered, resetting failure counter"
                );
            }
            *state = RunDegradationState::default();
        }
    }

    pub fn record_route_failure(&self, run_id: RunId, is_coordinator_failure: bool) -> RouteTransition {
        let mut runs = self.runs.lock();
        let state = runs.entry(run_id).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.consecutive_failures >= self.thresholds.stop_after_failures
            || (is_coordinator_failure && state.degraded)
        {
            return RouteTransition::Stop;
        }

        if state.consecutive_failures >= self.thresholds.degraded_after_failures && !state.degraded {
            state.degraded = true;
            return RouteTransition::Degraded;
        }

        RouteTransition::None
    }

    pub fn is_degraded(&self, run_id: RunId) -> bool {
        self.runs.lock().get(&run_id).is_some_and(|state| state.degraded)
    }

    pub fn consecutive_failures(&self, run_id: RunId) -> u32 {
        self.runs
            .lock()
            .get(&run_id)
            .map_or(0, |state| state.consecutive_failures)
    }

    pub fn clear_run(&self, run_id: RunId) {
        self.runs.lock().remove(&run_id);
    }
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self::new(DegradationThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_failures_degrade_then_stop() {
        let policy = DegradationPolicy::default();
        let run = RunId::new();

        assert_eq!(policy.record_route_failure(run, false), RouteTransition::None);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::Degraded);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::None);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::None);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::Stop);
        assert!(policy.is_degraded(run));
    }

    #[test]
    fn coordinator_failure_while_degraded_stops() {
        let policy = DegradationPolicy::default();
        let run = RunId::new();

        assert_eq!(policy.record_route_failure(run, false), RouteTransition::None);
        assert_eq!(policy.record_route_failure(run, true), RouteTransition::Degraded);
        assert_eq!(policy.record_route_failure(run, true), RouteTransition::Stop);
    }

    #[test]
    fn success_resets_and_rearms() {
        let policy = DegradationPolicy::default();
        let run = RunId::new();

        policy.record_route_failure(run, false);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::Degraded);

        policy.record_route_success(run, false);
        assert_eq!(policy.consecutive_failures(run), 0);
        assert!(!policy.is_degraded(run));

        assert_eq!(policy.record_route_failure(run, true), RouteTransition::None);
        assert_eq!(policy.record_route_failure(run, false), RouteTransition::Degraded);
    }

    #[test]
    fn runs_are_isolated_and_clearable() {
        let policy = DegradationPolicy::new(DegradationThresholds {
            degraded_after_failures: 1,
            stop_after_failures: 3,
        });
        let first = RunId::new();
        let second = RunId::new();

        assert_eq!(policy.record_route_failure(first, false), RouteTransition::Degraded);
        assert_eq!(policy.record_route_failure(second, false), RouteTransition::Degraded);
        assert_eq!(policy.consecutive_failures(first), 1);

        policy.clear_run(first);
        assert_eq!(policy.consecutive_failures(first), 0);
        assert_eq!(policy.consecutive_failures(second), 1);
    }

    #[test]
    fn thresholds_from_config_are_clamped() {
        let thresholds = DegradationThresholds::from(&DegradationConfig {
            degraded_after_failures: 0,
            stop_after_failures: 0,
        });
        assert_eq!(thresholds.degraded_after_failures, 1);
        assert_eq!(thresholds.stop_after_failures, 1);
    }
}
