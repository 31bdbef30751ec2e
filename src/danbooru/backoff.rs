use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What happened in a group that just resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSummary {
    /// 1-based position of the first member.
    pub start: usize,
    pub len: usize,
    pub rate_limited: usize,
    pub server_errors: usize,
    /// Largest `Retry-After` hint seen in the group.
    pub retry_after: Option<Duration>,
}

impl GroupSummary {
    pub fn is_troubled(&self) -> bool {
        self.rate_limited > 0 || self.server_errors > 0
    }
}

/// Decides how long to pause between groups.
///
/// There is no formal "now throttling" signal from the upstream, so the policy is pluggable rather
/// than guessed once in the engine.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the next group, `None` to continue immediately.
    fn after_group(&self, summary: &GroupSummary) -> Option<Duration>;
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn after_group(&self, _summary: &GroupSummary) -> Option<Duration> {
        None
    }
}

/// Waits a fixed delay after troubled groups, or longer if the upstream asked for it.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl BackoffPolicy for FixedBackoff {
    fn after_group(&self, summary: &GroupSummary) -> Option<Duration> {
        if !summary.is_troubled() {
            return None;
        }
        Some(summary.retry_after.map_or(self.delay, |hint| hint.max(self.delay)))
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveBackoffConfig {
    /// Delay after the first troubled group.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied per consecutive troubled group.
    pub backoff_multiplier: f64,
    /// Applied per clean group until the delay falls back to the base.
    pub recovery_multiplier: f64,
}

impl Default for AdaptiveBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            recovery_multiplier: 0.5,
        }
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current_delay: Duration,
    consecutive_troubled: u32,
    total_troubled: u64,
    total_groups: u64,
}

/// Grows the pause on consecutive troubled groups and eases it back on clean ones.
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    config: AdaptiveBackoffConfig,
    state: Arc<RwLock<AdaptiveState>>,
}

impl AdaptiveBackoff {
    pub fn new() -> Self {
        Self::with_config(AdaptiveBackoffConfig::default())
    }

    pub fn with_config(config: AdaptiveBackoffConfig) -> Self {
        let state = AdaptiveState {
            current_delay: config.base_delay,
            consecutive_troubled: 0,
            total_troubled: 0,
            total_groups: 0,
        };
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

}

impl Default for AdaptiveBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffPolicy for AdaptiveBackoff {
    fn after_group(&self, summary: &GroupSummary) -> Option<Duration> {
        let mut state = self.state.write();
        state.total_groups += 1;

        if !summary.is_troubled() {
            state.consecutive_troubled = 0;
            let eased = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
            );
            state.current_delay = eased.max(self.config.base_delay);
            return None;
        }

        state.total_troubled += 1;
        let old_delay = state.current_delay;
        if state.consecutive_troubled > 0 {
            state.current_delay = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * self.config.backoff_multiplier,
            )
            .min(self.config.max_delay);
        }
        state.consecutive_troubled += 1;

        let delay = summary
            .retry_after
            .map_or(state.current_delay, |hint| hint.max(state.current_delay));

        if state.consecutive_troubled > 1 {
            warn!(
                consecutive = state.consecutive_troubled,
                total_troubled = state.total_troubled,
                total_groups = state.total_groups,
                "Repeated upstream trouble, increasing delay from {:?} to {:?}", old_delay, delay
            );
        } else {
            debug!(
                rate_limited = summary.rate_limited,
                server_errors = summary.server_errors,
                "Troubled group, pausing for {:?}", delay
            );
        }

        Some(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    None,
    Fixed,
    #[default]
    Adaptive,
}

/// Backoff section of `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// How many times the transient members of a group are sent again.
    pub max_group_retries: usize,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Adaptive,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_group_retries: 2,
        }
    }
}

impl BackoffSettings {
    pub fn build_policy(&self) -> Arc<dyn BackoffPolicy> {
        let base_delay = Duration::from_millis(self.base_delay_ms);
        match self.strategy {
            BackoffStrategy::None => Arc::new(NoBackoff),
            BackoffStrategy::Fixed => Arc::new(FixedBackoff { delay: base_delay }),
            BackoffStrategy::Adaptive => Arc::new(AdaptiveBackoff::with_config(AdaptiveBackoffConfig {
                base_delay,
                max_delay: Duration::from_millis(self.max_delay_ms).max(base_delay),
                backoff_multiplier: self.multiplier.max(1.0),
                ..AdaptiveBackoffConfig::default()
            })),
        }
    }
}
