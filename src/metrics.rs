//! Per-key health and performance metrics.
//!
//! One [`KeyMetrics`] record exists per live key. Records are created
//! when a key enters the pool and destroyed when it is evicted; they
//! are never shared across keys.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Smoothing factor for the rolling success-rate and latency averages.
const EWMA_ALPHA: f64 = 0.1;

/// Rolling health state for a single key.
#[derive(Debug, Clone)]
pub struct KeyMetrics {
    /// Exponentially weighted success rate in `[0, 1]`. Starts at 1.0.
    pub success_rate: f64,
    /// Exponentially weighted average response time in seconds.
    pub avg_response_time: f64,
    /// When the key was last selected for an attempt.
    pub last_used: Option<Instant>,
    /// Consecutive failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Healthy keys are preferred by health-aware strategies.
    pub is_healthy: bool,
    /// When the key's rate-limit window resets, if known.
    pub rate_limit_reset: Option<Instant>,
    /// Requests remaining in the current window. `None` = unbounded.
    pub requests_remaining: Option<u64>,

    failure_threshold: u32,
}

impl KeyMetrics {
    /// Fresh metrics for a key entering the pool.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            success_rate: 1.0,
            avg_response_time: 0.0,
            last_used: None,
            consecutive_failures: 0,
            is_healthy: true,
            rate_limit_reset: None,
            requests_remaining: None,
            failure_threshold,
        }
    }

    /// Fold the outcome of one attempt into the rolling state.
    ///
    /// A success resets `consecutive_failures` and marks the key
    /// healthy again; crossing the failure threshold marks it
    /// unhealthy.
    pub fn record(&mut self, success: bool, response_time: Duration, rate_limited: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = self.success_rate * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA;
        self.avg_response_time =
            self.avg_response_time * (1.0 - EWMA_ALPHA) + response_time.as_secs_f64() * EWMA_ALPHA;

        if success {
            self.consecutive_failures = 0;
            self.is_healthy = true;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.failure_threshold {
                self.is_healthy = false;
            }
        }

        if rate_limited {
            self.requests_remaining = Some(0);
        }
    }

    /// Mark the key as selected now.
    pub fn touch(&mut self) {
        self.last_used = Some(Instant::now());
    }

    /// Restore the key to a healthy state.
    pub fn reset_health(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
    }

    /// Seconds since the key was last used, or `None` if never.
    pub fn idle_time(&self) -> Option<Duration> {
        self.last_used.map(|t| t.elapsed())
    }

    /// Read-only snapshot for reporting.
    pub fn snapshot(&self) -> KeyStats {
        KeyStats {
            success_rate: self.success_rate,
            avg_response_time_ms: self.avg_response_time * 1000.0,
            consecutive_failures: self.consecutive_failures,
            is_healthy: self.is_healthy,
            requests_remaining: self.requests_remaining,
        }
    }
}

/// A point-in-time view of one key's metrics, safe to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    /// Rolling success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Rolling average response time in milliseconds.
    pub avg_response_time_ms: f64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Current health flag.
    pub is_healthy: bool,
    /// Requests remaining in the rate-limit window, if tracked.
    pub requests_remaining: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let m = KeyMetrics::new(3);
        assert_eq!(m.success_rate, 1.0);
        assert_eq!(m.avg_response_time, 0.0);
        assert!(m.is_healthy);
        assert_eq!(m.consecutive_failures, 0);
        assert!(m.last_used.is_none());
        assert!(m.requests_remaining.is_none());
    }

    #[test]
    fn test_failures_cross_threshold() {
        let mut m = KeyMetrics::new(3);
        m.record(false, Duration::from_millis(100), false);
        m.record(false, Duration::from_millis(100), false);
        assert!(m.is_healthy);

        m.record(false, Duration::from_millis(100), false);
        assert!(!m.is_healthy);
        assert_eq!(m.consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets_health() {
        let mut m = KeyMetrics::new(2);
        m.record(false, Duration::ZERO, false);
        m.record(false, Duration::ZERO, false);
        assert!(!m.is_healthy);

        m.record(true, Duration::from_millis(50), false);
        assert!(m.is_healthy);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[test]
    fn test_ewma_moves_toward_samples() {
        let mut m = KeyMetrics::new(3);
        m.record(false, Duration::from_secs(1), false);
        assert!((m.success_rate - 0.9).abs() < 1e-9);
        assert!((m.avg_response_time - 0.1).abs() < 1e-9);

        m.record(false, Duration::from_secs(1), false);
        assert!(m.success_rate < 0.9);
        assert!(m.avg_response_time > 0.1);
    }

    #[test]
    fn test_rate_limited_zeroes_remaining() {
        let mut m = KeyMetrics::new(3);
        m.record(false, Duration::ZERO, true);
        assert_eq!(m.requests_remaining, Some(0));
    }
}
