//! Key rotation strategies.
//!
//! A strategy picks which key serves the next attempt, given the live
//! pool and the per-key metrics. Strategies are rebuilt from their
//! [`StrategyKind`] whenever pool membership changes, so selection
//! state (like the round-robin cursor) never outlives the key list it
//! was built for.

use crate::metrics::KeyMetrics;
use rand::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

/// Policy selecting which key serves the next attempt.
///
/// `select` returns `None` only when `keys` is empty; the rotator maps
/// that to its exhaustion error. Implementations may update per-key
/// metrics (health-aware strategies do).
pub trait RotationStrategy: Send + Sync {
    /// Choose the next key from `keys` (insertion-ordered pool).
    fn select(&mut self, keys: &[String], metrics: &mut HashMap<String, KeyMetrics>)
        -> Option<String>;
}

/// Tagged description of a strategy: its kind plus construction
/// parameters. Carried alongside the live instance so rebuilding after
/// an eviction is a pure function of (kind, remaining keys) rather
/// than runtime type inspection.
#[derive(Debug, Clone)]
pub enum StrategyKind {
    /// Cursor over the insertion-ordered pool, wrapping modulo size.
    RoundRobin,
    /// Uniform choice over the current pool each call.
    Random,
    /// Probability proportional to static per-key weights. Keys absent
    /// from the map weigh 1. The weight set is immutable after
    /// construction.
    Weighted {
        /// Static integer weight per key.
        weights: HashMap<String, u32>,
    },
    /// Uniform choice over the healthy subset, with optimistic
    /// recovery when no key is healthy.
    HealthBased {
        /// Keys idle longer than this are considered worth re-probing
        /// even while marked unhealthy.
        health_check_interval: Duration,
    },
    /// The key with the oldest `last_used` timestamp; ties broken by
    /// insertion order.
    LeastRecentlyUsed,
}

impl StrategyKind {
    /// Build a fresh strategy instance for the current pool.
    pub fn build(&self) -> Box<dyn RotationStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobinStrategy { cursor: 0 }),
            Self::Random => Box::new(RandomStrategy),
            Self::Weighted { weights } => Box::new(WeightedStrategy {
                weights: weights.clone(),
            }),
            Self::HealthBased {
                health_check_interval,
            } => Box::new(HealthBasedStrategy {
                health_check_interval: *health_check_interval,
            }),
            Self::LeastRecentlyUsed => Box::new(LruStrategy),
        }
    }
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::RoundRobin
    }
}

struct RoundRobinStrategy {
    cursor: usize,
}

impl RotationStrategy for RoundRobinStrategy {
    fn select(
        &mut self,
        keys: &[String],
        _metrics: &mut HashMap<String, KeyMetrics>,
    ) -> Option<String> {
        if keys.is_empty() {
            return None;
        }
        let key = keys[self.cursor % keys.len()].clone();
        self.cursor = (self.cursor + 1) % keys.len();
        Some(key)
    }
}

struct RandomStrategy;

impl RotationStrategy for RandomStrategy {
    fn select(
        &mut self,
        keys: &[String],
        _metrics: &mut HashMap<String, KeyMetrics>,
    ) -> Option<String> {
        keys.choose(&mut rand::rng()).cloned()
    }
}

struct WeightedStrategy {
    weights: HashMap<String, u32>,
}

impl WeightedStrategy {
    fn weight_of(&self, key: &str) -> u32 {
        self.weights.get(key).copied().unwrap_or(1)
    }
}

impl RotationStrategy for WeightedStrategy {
    fn select(
        &mut self,
        keys: &[String],
        _metrics: &mut HashMap<String, KeyMetrics>,
    ) -> Option<String> {
        if keys.is_empty() {
            return None;
        }

        let total: u32 = keys.iter().map(|k| self.weight_of(k)).sum();
        if total == 0 {
            return keys.first().cloned();
        }

        // Cumulative-weight scan over the insertion-ordered pool.
        let mut pick = rand::rng().random_range(0..total);
        for key in keys {
            let weight = self.weight_of(key);
            if pick < weight {
                return Some(key.clone());
            }
            pick -= weight;
        }

        keys.first().cloned()
    }
}

struct HealthBasedStrategy {
    health_check_interval: Duration,
}

impl HealthBasedStrategy {
    fn is_selectable(&self, metrics: Option<&KeyMetrics>) -> bool {
        match metrics {
            Some(m) => {
                // Idle keys get re-probed even while marked unhealthy;
                // never-used keys count as idle forever.
                m.is_healthy
                    || m.idle_time()
                        .map_or(true, |idle| idle > self.health_check_interval)
            }
            None => true,
        }
    }
}

impl RotationStrategy for HealthBasedStrategy {
    fn select(
        &mut self,
        keys: &[String],
        metrics: &mut HashMap<String, KeyMetrics>,
    ) -> Option<String> {
        if keys.is_empty() {
            return None;
        }

        let healthy: Vec<&String> = keys
            .iter()
            .filter(|k| self.is_selectable(metrics.get(k.as_str())))
            .collect();

        if !healthy.is_empty() {
            return healthy.choose(&mut rand::rng()).map(|k| (*k).clone());
        }

        // Optimistic recovery: with no healthy keys left, mark everyone
        // healthy again and pick anyway. A permanent deadlock where no
        // key is ever tried again would be worse than re-probing.
        for key in keys {
            if let Some(m) = metrics.get_mut(key) {
                m.reset_health();
            }
        }
        keys.choose(&mut rand::rng()).cloned()
    }
}

struct LruStrategy;

impl RotationStrategy for LruStrategy {
    fn select(
        &mut self,
        keys: &[String],
        metrics: &mut HashMap<String, KeyMetrics>,
    ) -> Option<String> {
        keys.iter()
            .enumerate()
            // `None < Some(_)`, so never-used keys sort oldest; the
            // index makes the ordering total, breaking timestamp ties
            // by insertion order.
            .min_by_key(|(idx, key)| (metrics.get(key.as_str()).and_then(|m| m.last_used), *idx))
            .map(|(_, key)| key.clone())
    }
}
