//! Recommendation metrics and timing
//!
//! Counters go through the `metrics` facade; with the `metrics` feature the
//! binary installs a Prometheus exporter, otherwise they are no-ops.

use serde::Serialize;
use std::time::Instant;

use super::fusion::SpaceScores;
use super::vector::EmbeddingSpace;

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: &'static str,
}

impl PerformanceTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        metrics::histogram!("recommendation_phase_duration_ms", "phase" => self.label)
            .record(elapsed as f64);
    }
}

pub fn record_recommendation(strategy: &'static str, returned: usize) {
    metrics::counter!("recommendations_total", "strategy" => strategy).increment(1);
    metrics::histogram!("recommendation_items", "strategy" => strategy).record(returned as f64);
}

pub fn record_space_unavailable(space: EmbeddingSpace) {
    metrics::counter!("recommendation_space_unavailable_total", "space" => space.as_str())
        .increment(1);
}

/// How many returned items each space contributed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpaceCoverage {
    pub content: usize,
    pub collaborative: usize,
    pub graph: usize,
    pub total: usize,
}

impl SpaceCoverage {
    pub fn from_scores<'a, I>(scores: I) -> Self
    where
        I: IntoIterator<Item = &'a SpaceScores>,
    {
        let mut coverage = Self::default();
        for s in scores {
            coverage.total += 1;
            for (space, _) in s.contributing() {
                match space {
                    EmbeddingSpace::Content => coverage.content += 1,
                    EmbeddingSpace::Collaborative => coverage.collaborative += 1,
                    EmbeddingSpace::Graph => coverage.graph += 1,
                }
            }
        }
        coverage
    }

    /// Share of items scored by a single space (cold-start heavy results)
    pub fn single_space_ratio<'a, I>(scores: I) -> f32
    where
        I: IntoIterator<Item = &'a SpaceScores>,
    {
        let mut total = 0usize;
        let mut single = 0usize;
        for s in scores {
            total += 1;
            if s.contributing().count() == 1 {
                single += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        single as f32 / total as f32
    }
}
