//! RPM/TPM rolling-minute counters
//!
//! Two counter families: per `(channel_or_star, model)` and per
//! `(group, model, token_name)`. Counts live in 1-second buckets over a
//! 60-second window. Updates are best-effort: a lost write never blocks
//! serving, and concurrent increments are both kept.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Aggregate view over all channels
pub const CHANNEL_STAR: &str = "*";

const WINDOW_SECS: u64 = 60;

#[derive(Debug, Default)]
struct Window {
    /// (second, count), oldest first
    buckets: VecDeque<(u64, u64)>,
}

impl Window {
    fn add(&mut self, now: u64, amount: u64) {
        match self.buckets.back_mut() {
            Some((sec, count)) if *sec == now => *count += amount,
            _ => self.buckets.push_back((now, amount)),
        }
        while let Some((sec, _)) = self.buckets.front() {
            if now.saturating_sub(*sec) >= WINDOW_SECS {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn total(&self, now: u64) -> u64 {
        self.buckets
            .iter()
            .filter(|(sec, _)| now.saturating_sub(*sec) < WINDOW_SECS)
            .map(|(_, count)| count)
            .sum()
    }
}

#[derive(Debug, Default)]
struct Counter {
    rpm: Window,
    tpm: Window,
}

/// Rolling-minute request and token counters.
#[derive(Default)]
pub struct RateLimiter {
    channel_model: DashMap<(String, String), Mutex<Counter>>,
    group_model_token: DashMap<(String, String, String), Mutex<Counter>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted request. The channel counter is written both
    /// under the literal id and under the `"*"` aggregate.
    pub fn record_request(&self, channel: i32, model: &str, group: &str, token_name: &str) {
        let now = now_secs();
        for channel_key in [channel.to_string(), CHANNEL_STAR.to_string()] {
            let entry = self
                .channel_model
                .entry((channel_key, model.to_string()))
                .or_default();
            entry.lock().rpm.add(now, 1);
        }
        let entry = self
            .group_model_token
            .entry((group.to_string(), model.to_string(), token_name.to_string()))
            .or_default();
        entry.lock().rpm.add(now, 1);
    }

    /// Record finalized token usage for one request.
    pub fn record_tokens(
        &self,
        channel: i32,
        model: &str,
        group: &str,
        token_name: &str,
        tokens: u64,
    ) {
        if tokens == 0 {
            return;
        }
        let now = now_secs();
        for channel_key in [channel.to_string(), CHANNEL_STAR.to_string()] {
            let entry = self
                .channel_model
                .entry((channel_key, model.to_string()))
                .or_default();
            entry.lock().tpm.add(now, tokens);
        }
        let entry = self
            .group_model_token
            .entry((group.to_string(), model.to_string(), token_name.to_string()))
            .or_default();
        entry.lock().tpm.add(now, tokens);
    }

    /// Current rolling RPM for a channel (or `"*"`) and model.
    pub fn channel_rpm(&self, channel: &str, model: &str) -> u64 {
        self.channel_model
            .get(&(channel.to_string(), model.to_string()))
            .map(|entry| entry.lock().rpm.total(now_secs()))
            .unwrap_or(0)
    }

    /// Current rolling TPM for a channel (or `"*"`) and model.
    pub fn channel_tpm(&self, channel: &str, model: &str) -> u64 {
        self.channel_model
            .get(&(channel.to_string(), model.to_string()))
            .map(|entry| entry.lock().tpm.total(now_secs()))
            .unwrap_or(0)
    }

    /// Current rolling RPM for a (group, model, token_name) triple.
    pub fn group_rpm(&self, group: &str, model: &str, token_name: &str) -> u64 {
        self.group_model_token
            .get(&(group.to_string(), model.to_string(), token_name.to_string()))
            .map(|entry| entry.lock().rpm.total(now_secs()))
            .unwrap_or(0)
    }

    /// Current rolling TPM for a (group, model, token_name) triple.
    pub fn group_tpm(&self, group: &str, model: &str, token_name: &str) -> u64 {
        self.group_model_token
            .get(&(group.to_string(), model.to_string(), token_name.to_string()))
            .map(|entry| entry.lock().tpm.total(now_secs()))
            .unwrap_or(0)
    }

    /// Rolling RPM for a group+model summed over all token names, used
    /// for cap enforcement.
    pub fn group_model_rpm(&self, group: &str, model: &str) -> u64 {
        let now = now_secs();
        self.group_model_token
            .iter()
            .filter(|entry| {
                let (g, m, _) = entry.key();
                g == group && m == model
            })
            .map(|entry| entry.lock().rpm.total(now))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_counts_within_window() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.record_request(1, "m", "acme", "tok");
        }
        assert_eq!(limiter.channel_rpm("1", "m"), 5);
        assert_eq!(limiter.channel_rpm(CHANNEL_STAR, "m"), 5);
        assert_eq!(limiter.group_rpm("acme", "m", "tok"), 5);
        assert_eq!(limiter.channel_rpm("2", "m"), 0);
    }

    #[test]
    fn tpm_accumulates_token_totals() {
        let limiter = RateLimiter::new();
        limiter.record_tokens(1, "m", "acme", "tok", 8);
        limiter.record_tokens(1, "m", "acme", "tok", 4);
        assert_eq!(limiter.channel_tpm("1", "m"), 12);
        assert_eq!(limiter.group_tpm("acme", "m", "tok"), 12);
    }

    #[test]
    fn group_model_rpm_sums_token_names() {
        let limiter = RateLimiter::new();
        limiter.record_request(1, "m", "acme", "alpha");
        limiter.record_request(2, "m", "acme", "beta");
        assert_eq!(limiter.group_model_rpm("acme", "m"), 2);
        assert_eq!(limiter.group_model_rpm("acme", "other"), 0);
    }

    #[test]
    fn window_drops_old_buckets() {
        let mut window = Window::default();
        window.add(100, 3);
        window.add(130, 2);
        assert_eq!(window.total(130), 5);
        // 100 is exactly 60s old at 160: outside the window
        assert_eq!(window.total(160), 2);
        window.add(200, 1);
        assert_eq!(window.total(200), 1);
    }
}
