//! Turns per-cycle detection metrics into a stable alarm condition.

use chrono::{DateTime, Utc};

/// How a per-cycle metric becomes an alarm condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebouncePolicy {
    /// Raise after `threshold` consecutive positive cycles; clear on the
    /// first negative one. The metric is a count; positive means non-zero.
    ConsecutiveCount { threshold: u32 },
    /// Condition holds while the metric is at or above `threshold`, a
    /// fraction in `[0, 1]`. No smoothing.
    RatioThreshold { threshold: f32 },
}

impl DebouncePolicy {
    fn qualifies(&self, metric: f32) -> bool {
        match *self {
            DebouncePolicy::ConsecutiveCount { .. } => metric > 0.0,
            DebouncePolicy::RatioThreshold { threshold } => metric >= threshold,
        }
    }
}

/// Result of feeding one metric to a [`Debouncer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceUpdate {
    pub value: bool,
    pub previous: bool,
    pub metric: f32,
}

impl DebounceUpdate {
    pub fn changed(&self) -> bool {
        self.value != self.previous
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    policy: DebouncePolicy,
    value: bool,
    consecutive: u32,
    frames_since_change: u64,
    last_metric: f32,
    last_changed: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            value: false,
            consecutive: 0,
            frames_since_change: 0,
            last_metric: 0.0,
            last_changed: None,
        }
    }

    pub fn observe(&mut self, metric: f32) -> DebounceUpdate {
        self.observe_at(metric, Utc::now())
    }

    pub fn observe_at(&mut self, metric: f32, at: DateTime<Utc>) -> DebounceUpdate {
        let previous = self.value;
        let positive = self.policy.qualifies(metric);
        self.consecutive = if positive {
            self.consecutive.saturating_add(1)
        } else {
            0
        };
        self.value = match self.policy {
            DebouncePolicy::ConsecutiveCount { threshold } => {
                positive && self.consecutive >= threshold.max(1)
            }
            DebouncePolicy::RatioThreshold { .. } => positive,
        };
        self.last_metric = metric;
        if self.value != previous {
            self.frames_since_change = 0;
            self.last_changed = Some(at);
        } else {
            self.frames_since_change = self.frames_since_change.saturating_add(1);
        }
        DebounceUpdate {
            value: self.value,
            previous,
            metric,
        }
    }

    /// Back to the initial cleared state.
    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }

    pub fn policy(&self) -> DebouncePolicy {
        self.policy
    }

    pub fn value(&self) -> bool {
        self.value
    }

    /// Consecutive qualifying cycles up to and including the latest.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn frames_since_change(&self) -> u64 {
        self.frames_since_change
    }

    pub fn last_metric(&self) -> f32 {
        self.last_metric
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(threshold: u32) -> Debouncer {
        Debouncer::new(DebouncePolicy::ConsecutiveCount { threshold })
    }

    #[test]
    fn raises_exactly_on_nth_consecutive_positive() {
        for threshold in 1..6u32 {
            let mut deb = presence(threshold);
            let mut raised_on = Vec::new();
            for frame in 1..=10u32 {
                if deb.observe(1.0).changed() {
                    raised_on.push(frame);
                }
            }
            assert_eq!(raised_on, vec![threshold]);
            assert!(deb.value());
        }
    }

    #[test]
    fn clears_on_first_negative() {
        let mut deb = presence(3);
        for _ in 0..3 {
            deb.observe(2.0);
        }
        assert!(deb.value());
        let update = deb.observe(0.0);
        assert!(update.changed());
        assert!(!update.value);
        assert_eq!(deb.consecutive(), 0);
    }

    #[test]
    fn positives_are_not_cumulative() {
        let mut deb = presence(3);
        for metric in [1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0] {
            assert!(!deb.observe(metric).value);
        }
    }

    #[test]
    fn ratio_tracks_threshold_without_hysteresis() {
        let mut deb = Debouncer::new(DebouncePolicy::RatioThreshold { threshold: 0.73 });
        assert!(deb.observe(0.80).value);
        assert!(deb.observe(0.80).value);
        assert!(!deb.observe(0.70).value);
        assert!(!deb.observe(0.70).value);
        assert!(deb.observe(0.73).value);
        assert_eq!(deb.last_metric(), 0.73);
    }

    #[test]
    fn tracks_frames_since_change() {
        let mut deb = presence(1);
        let at = Utc::now();
        deb.observe_at(1.0, at);
        assert_eq!(deb.frames_since_change(), 0);
        assert_eq!(deb.last_changed(), Some(at));
        deb.observe(1.0);
        deb.observe(1.0);
        assert_eq!(deb.frames_since_change(), 2);
        assert_eq!(deb.last_changed(), Some(at));
    }

    #[test]
    fn reset_clears_state_but_keeps_policy() {
        let mut deb = presence(2);
        deb.observe(1.0);
        deb.observe(1.0);
        deb.reset();
        assert!(!deb.value());
        assert_eq!(deb.consecutive(), 0);
        assert_eq!(deb.policy(), DebouncePolicy::ConsecutiveCount { threshold: 2 });
    }
}
