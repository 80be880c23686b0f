use std::{collections::VecDeque, time::Duration};

use serde::Serialize;

/// Samples kept for the rolling figures.
const WINDOW: usize = 100;

/// Rolling inference timings for one camera.
#[derive(Debug, Clone)]
pub struct InferenceStats {
    window: VecDeque<Duration>,
    last: Option<Duration>,
    total: u64,
    failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InferenceSummary {
    pub last_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total: u64,
    pub failures: u64,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW),
            last: None,
            total: 0,
            failures: 0,
        }
    }
}

impl InferenceStats {
    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
        self.last = Some(elapsed);
        self.total += 1;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn summary(&self) -> InferenceSummary {
        let ms = |d: &Duration| d.as_secs_f64() * 1000.0;
        if self.window.is_empty() {
            return InferenceSummary {
                failures: self.failures,
                ..InferenceSummary::default()
            };
        }
        let sum: f64 = self.window.iter().map(ms).sum();
        InferenceSummary {
            last_ms: self.last.as_ref().map_or(0.0, ms),
            avg_ms: sum / self.window.len() as f64,
            min_ms: self.window.iter().map(ms).fold(f64::INFINITY, f64::min),
            max_ms: self.window.iter().map(ms).fold(0.0, f64::max),
            total: self.total,
            failures: self.failures,
        }
    }
}
