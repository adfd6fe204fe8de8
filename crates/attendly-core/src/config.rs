//! Explicit configuration handed to each pipeline component at construction.

use crate::types::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid config: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidConfig { field, reason: reason.into() }
    }
}

/// Tunables for matching, sampling and session tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum distance for a positive match (metric-dependent scale).
    pub tolerance: f32,
    pub metric: DistanceMetric,
    /// Active sessions with no sighting for longer than this close.
    pub session_timeout: Duration,
    /// Suppression window after a session closes.
    pub cooldown_period: Duration,
    /// Minimum spacing between processed frames; frames in between are dropped.
    pub sample_interval: Duration,
    /// Faces beyond this count in one frame are ignored.
    pub max_faces_per_frame: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.6,
            metric: DistanceMetric::Cosine,
            session_timeout: Duration::from_secs(300),
            cooldown_period: Duration::from_secs(60),
            sample_interval: Duration::from_millis(100),
            max_faces_per_frame: 10,
        }
    }
}

impl PipelineConfig {
    /// Reject non-positive values and a non-finite tolerance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tolerance.is_finite() {
            return Err(ConfigError::invalid("tolerance", "must be finite"));
        }
        if self.tolerance <= 0.0 {
            return Err(ConfigError::invalid("tolerance", format!("must be positive, got {}", self.tolerance)));
        }
        for (field, value) in [
            ("session_timeout", self.session_timeout),
            ("cooldown_period", self.cooldown_period),
            ("sample_interval", self.sample_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.max_faces_per_frame == 0 {
            return Err(ConfigError::invalid("max_faces_per_frame", "must be positive"));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for event sink delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be positive"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::invalid("max_backoff", "must be >= initial_backoff"));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based), doubling and capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
