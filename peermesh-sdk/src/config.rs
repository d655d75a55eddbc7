//! Tuning knobs for the heartbeat and polling loops.

use std::time::Duration;

/// Adaptive polling policy for a log pull loop.
///
/// Every empty pull grows the delay by `backoff_factor` up to `max_delay`;
/// any non-empty batch snaps it back to `initial_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    /// Delay after a productive pull.
    pub initial_delay: Duration,
    /// Upper bound the delay never exceeds.
    pub max_delay: Duration,
    /// Multiplier applied after each empty pull.
    pub backoff_factor: f64,
}

impl PollConfig {
    /// Policy for per-pair channel logs: 100 ms doubling up to 5 s.
    pub fn channel() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_factor: 2.0,
        }
    }

    /// Policy for room presence logs: gentler 1.5x growth, same bounds.
    pub fn room() -> Self {
        Self {
            backoff_factor: 1.5,
            ..Self::channel()
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::channel()
    }
}

/// Stepper that tracks the current delay of one pull loop.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    config: PollConfig,
    current: Duration,
}

impl PollBackoff {
    pub fn new(config: PollConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
        }
    }

    /// The delay to sleep before the next pull.
    pub fn delay(&self) -> Duration {
        self.current
    }

    /// A batch arrived: snap back to the initial delay.
    pub fn on_events(&mut self) {
        self.current = self.config.initial_delay;
    }

    /// Empty pull (or transient failure): grow toward the cap.
    pub fn on_empty(&mut self) {
        self.current = self
            .current
            .mul_f64(self.config.backoff_factor)
            .min(self.config.max_delay);
    }
}

/// Configuration for one peer's mesh participation.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Interval between `alive` heartbeats on the room log.
    pub heartbeat_interval: Duration,
    /// Polling policy for the room presence log.
    pub room_poll: PollConfig,
    /// Polling policy for per-pair channel logs.
    pub channel_poll: PollConfig,
    /// Label the initiator requests for the pair data channel.
    pub data_channel_label: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5000),
            room_poll: PollConfig::room(),
            channel_poll: PollConfig::channel(),
            data_channel_label: "default".to_string(),
        }
    }
}
