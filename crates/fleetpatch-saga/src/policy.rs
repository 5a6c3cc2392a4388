//! Per-step timeouts and retry policies.
//!
//! Every step runs under a [`StepOptions`]: a per-attempt timeout, an
//! optional heartbeat liveness window, and a [`RetryPolicy`]. Defaults come
//! from [`StepKind::default_options`] and can be overridden per step through
//! [`StepPolicies`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ops::{FailureClass, OpError};
use crate::step::StepKind;

/// How failed attempts of a step are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. `0` means unlimited.
    pub maximum_attempts: u32,
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on the delay. Defaults to 100x the initial interval.
    pub maximum_interval: Option<Duration>,
    /// Error types that end the step without further attempts.
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries at a fixed interval.
    pub fn constant(maximum_attempts: u32, interval: Duration) -> Self {
        Self {
            maximum_attempts,
            initial_interval: interval,
            backoff_coefficient: 1.0,
            maximum_interval: None,
            non_retryable_error_types: Vec::new(),
        }
    }

    /// Check the policy for values the executor cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(format!(
                "backoff_coefficient must be >= 1.0, got {}",
                self.backoff_coefficient
            ));
        }
        if self
            .maximum_interval
            .is_some_and(|max| max < self.initial_interval)
        {
            return Err("maximum_interval must not be below initial_interval".to_string());
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.maximum_attempts == 0 || attempts_made < self.maximum_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self
            .maximum_interval
            .unwrap_or(self.initial_interval.saturating_mul(100))
            .as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        Duration::try_from_secs_f64(secs.min(cap).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether `error` ends the step immediately.
    pub fn is_non_retryable(&self, error: &OpError) -> bool {
        error.class != FailureClass::Transient
            || self
                .non_retryable_error_types
                .iter()
                .any(|t| t == &error.error_type)
    }
}

/// Timeouts and retry policy for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Upper bound on a single attempt.
    pub timeout: Duration,
    /// Maximum silence between heartbeats before an attempt is abandoned.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl StepKind {
    /// Built-in options for this step.
    ///
    /// Host discovery is a quick lookup, the update itself is long-running
    /// and heartbeats, and the health check polls at a constant interval.
    pub fn default_options(self) -> StepOptions {
        let retry = RetryPolicy::default();
        match self {
            StepKind::GetClusterHosts => StepOptions {
                timeout: Duration::from_secs(2),
                heartbeat_timeout: None,
                retry,
            },
            StepKind::PerformUpdate => StepOptions {
                timeout: Duration::from_secs(10),
                heartbeat_timeout: Some(Duration::from_secs(2)),
                retry,
            },
            StepKind::CheckServiceHealth => StepOptions {
                timeout: Duration::from_secs(5),
                heartbeat_timeout: None,
                retry: RetryPolicy::constant(10, Duration::from_secs(1)),
            },
            _ => StepOptions {
                timeout: Duration::from_secs(5),
                heartbeat_timeout: None,
                retry,
            },
        }
    }
}

/// Step options with per-step overrides layered over the defaults.
#[derive(Debug, Clone, Default)]
pub struct StepPolicies {
    overrides: HashMap<StepKind, StepOptions>,
}

impl StepPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the options used for `kind`.
    pub fn with_override(mut self, kind: StepKind, options: StepOptions) -> Self {
        self.overrides.insert(kind, options);
        self
    }

    /// Replace the options used for `kind` in place.
    pub fn set(&mut self, kind: StepKind, options: StepOptions) {
        self.overrides.insert(kind, options);
    }

    /// Effective options for `kind`.
    pub fn options(&self, kind: StepKind) -> StepOptions {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_options())
    }
}

/// Campaign-wide saga settings.
#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// How long a campaign waits for its approval signal.
    pub approval_timeout: Duration,
    pub policies: StepPolicies,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(300),
            policies: StepPolicies::default(),
        }
    }
}
