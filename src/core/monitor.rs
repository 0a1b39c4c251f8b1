//! Health monitor
//!
//! Rolling error rates and auto-bans per (channel, model). Counters are
//! sharded through DashMap; each record is touched under its own entry
//! lock, there is no global lock.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::MonitorConfig;

#[derive(Debug)]
struct HealthRecord {
    /// (when, was_error), oldest first, bounded by max_samples
    outcomes: VecDeque<(Instant, bool)>,
    banned_until: Option<Instant>,
    last_touch: Instant,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::new(),
            banned_until: None,
            last_touch: Instant::now(),
        }
    }

    fn push(&mut self, now: Instant, was_error: bool, window: Duration, max_samples: usize) {
        self.last_touch = now;
        self.outcomes.push_back((now, was_error));
        while self.outcomes.len() > max_samples {
            self.outcomes.pop_front();
        }
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self, now: Instant, window: Duration) -> (f64, usize) {
        let mut errors = 0usize;
        let mut total = 0usize;
        for (at, was_error) in &self.outcomes {
            if now.duration_since(*at) <= window {
                total += 1;
                if *was_error {
                    errors += 1;
                }
            }
        }
        if total == 0 {
            (0.0, 0)
        } else {
            (errors as f64 / total as f64, total)
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }
}

/// Process-wide health state, injected through the relay context.
pub struct HealthMonitor {
    records: DashMap<(i32, String), HealthRecord>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    pub fn record_success(&self, channel: i32, model: &str) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry((channel, model.to_string()))
            .or_insert_with(HealthRecord::new);
        record.push(now, false, self.window(), self.config.max_samples);
    }

    /// Record a failed attempt. Auto-bans the pair once the windowed
    /// error rate crosses the threshold with enough samples.
    pub fn record_error(&self, channel: i32, model: &str) {
        let now = Instant::now();
        let window = self.window();
        let mut record = self
            .records
            .entry((channel, model.to_string()))
            .or_insert_with(HealthRecord::new);
        record.push(now, true, window, self.config.max_samples);

        let (rate, samples) = record.error_rate(now, window);
        if samples >= self.config.min_samples
            && rate >= self.config.ban_threshold
            && !record.is_banned(now)
        {
            record.banned_until = Some(now + Duration::from_secs(self.config.ban_duration_secs));
            debug!(channel, model, rate, "auto-banned channel for model");
        }
    }

    /// Windowed error rate per channel for one model.
    pub fn error_rates(&self, model: &str) -> HashMap<i32, f64> {
        let now = Instant::now();
        let window = self.window();
        let mut rates = HashMap::new();
        for entry in self.records.iter() {
            let (channel, record_model) = entry.key();
            if record_model == model {
                let (rate, samples) = entry.value().error_rate(now, window);
                if samples > 0 {
                    rates.insert(*channel, rate);
                }
            }
        }
        rates
    }

    /// Channels currently banned for one model.
    pub fn banned_channels(&self, model: &str) -> Vec<i32> {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|entry| entry.key().1 == model && entry.value().is_banned(now))
            .map(|entry| entry.key().0)
            .collect()
    }

    /// Manually ban one pair, e.g. from the admin layer.
    pub fn ban(&self, channel: i32, model: &str, duration: Duration) {
        let mut record = self
            .records
            .entry((channel, model.to_string()))
            .or_insert_with(HealthRecord::new);
        record.banned_until = Some(Instant::now() + duration);
    }

    /// Drop all state for a channel; called on channel CRUD.
    pub fn clear_channel(&self, channel: i32) {
        self.records.retain(|(id, _), _| *id != channel);
    }

    /// Evict records idle past the TTL. Called from a periodic task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.record_ttl_secs);
        self.records
            .retain(|_, record| now.duration_since(record.last_touch) <= ttl || record.is_banned(now));
    }
}

/// Clamp an observed error rate into the weighting range. Avoids both
/// divide-by-zero and the "forever first" trap for a channel with zero
/// observed errors.
pub fn clamp_error_rate(rate: f64) -> f64 {
    rate.clamp(0.1, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(MonitorConfig {
            window_secs: 300,
            max_samples: 64,
            min_samples: 4,
            ban_threshold: 0.5,
            ban_duration_secs: 60,
            record_ttl_secs: 3600,
        })
    }

    #[test]
    fn error_rate_reflects_outcomes() {
        let m = monitor();
        m.record_success(1, "m");
        m.record_success(1, "m");
        m.record_error(1, "m");
        m.record_error(1, "m");

        let rates = m.error_rates("m");
        assert!((rates[&1] - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn ban_triggers_after_min_samples() {
        let m = monitor();
        m.record_error(7, "m");
        m.record_error(7, "m");
        m.record_error(7, "m");
        assert!(m.banned_channels("m").is_empty());

        m.record_error(7, "m");
        assert_eq!(m.banned_channels("m"), vec![7]);
    }

    #[test]
    fn bans_are_scoped_to_the_model() {
        let m = monitor();
        for _ in 0..4 {
            m.record_error(7, "m");
        }
        assert!(m.banned_channels("other").is_empty());
    }

    #[test]
    fn clear_channel_drops_all_state() {
        let m = monitor();
        for _ in 0..4 {
            m.record_error(7, "m");
        }
        m.clear_channel(7);
        assert!(m.banned_channels("m").is_empty());
        assert!(m.error_rates("m").is_empty());
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_error_rate(0.0), 0.1);
        assert_eq!(clamp_error_rate(0.5), 0.5);
        assert_eq!(clamp_error_rate(2.0), 1.0);
    }
}
