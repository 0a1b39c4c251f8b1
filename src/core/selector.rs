//! Weighted random channel selection
//!
//! Filters the candidate list down to channels that are enabled, support
//! the requested mode, and are not in the ignore set, then draws one with
//! probability proportional to `priority / clamp(error_rate, 0.1, 1.0)`.

use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::mode::Mode;
use crate::core::model::{Channel, ChannelStatus};
use crate::core::monitor::clamp_error_rate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// The unfiltered candidate list was empty: nothing declares the model
    #[error("channels not found")]
    ChannelsNotFound,
    /// Filtering emptied the list: everything is ignored or unsupported
    #[error("channels exhausted")]
    ChannelsExhausted,
}

/// Pick a channel from `candidates` using the process RNG.
pub fn choose(
    candidates: &[Arc<Channel>],
    mode: Mode,
    error_rates: &HashMap<i32, f64>,
    ignore: &HashSet<i32>,
    supports: impl Fn(&Channel, Mode) -> bool,
) -> Result<Arc<Channel>, SelectError> {
    choose_with_rng(
        candidates,
        mode,
        error_rates,
        ignore,
        supports,
        &mut rand::thread_rng(),
    )
}

/// Same as [`choose`] with an injected RNG, for deterministic tests.
pub fn choose_with_rng<R: Rng + ?Sized>(
    candidates: &[Arc<Channel>],
    mode: Mode,
    error_rates: &HashMap<i32, f64>,
    ignore: &HashSet<i32>,
    supports: impl Fn(&Channel, Mode) -> bool,
    rng: &mut R,
) -> Result<Arc<Channel>, SelectError> {
    if candidates.is_empty() {
        return Err(SelectError::ChannelsNotFound);
    }

    let survivors: Vec<&Arc<Channel>> = candidates
        .iter()
        .filter(|c| c.status == ChannelStatus::Enabled)
        .filter(|c| supports(c, mode))
        .filter(|c| !ignore.contains(&c.id))
        .collect();

    if survivors.is_empty() {
        return Err(SelectError::ChannelsExhausted);
    }

    if survivors.len() == 1 {
        return Ok(survivors[0].clone());
    }

    let weights: Vec<f64> = survivors
        .iter()
        .map(|c| weight(c, error_rates.get(&c.id).copied().unwrap_or(0.0)))
        .collect();
    let total: f64 = weights.iter().sum();

    if total <= 0.0 {
        // degenerate weights: uniform draw
        return Ok((*survivors.choose(rng).expect("non-empty")).clone());
    }

    let mut draw = rng.gen_range(0.0..total);
    for (channel, weight) in survivors.iter().zip(&weights) {
        draw -= weight;
        if draw < 0.0 {
            return Ok((*channel).clone());
        }
    }

    // floating point edge: fall back to the last survivor
    Ok(survivors[survivors.len() - 1].clone())
}

fn weight(channel: &Channel, error_rate: f64) -> f64 {
    f64::from(channel.effective_priority()) / clamp_error_rate(error_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ChannelType;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap as Map;

    fn channel(id: i32, priority: i32, status: ChannelStatus) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            name: format!("ch-{id}"),
            channel_type: ChannelType::OpenAI,
            base_url: String::new(),
            key: "sk".into(),
            models: vec!["m".into()],
            model_mapping: Map::new(),
            priority,
            status,
            sets: Vec::new(),
            config: None,
            used_amount: 0.0,
            request_count: 0,
            retry_count: 0,
            balance: 0.0,
            balance_updated_at: None,
            last_test_error_at: None,
        })
    }

    fn always(_: &Channel, _: Mode) -> bool {
        true
    }

    #[test]
    fn empty_candidates_is_not_found() {
        let err = choose(&[], Mode::ChatCompletions, &HashMap::new(), &HashSet::new(), always)
            .unwrap_err();
        assert_eq!(err, SelectError::ChannelsNotFound);
    }

    #[test]
    fn fully_filtered_is_exhausted() {
        let candidates = vec![channel(1, 0, ChannelStatus::Enabled)];
        let ignore: HashSet<i32> = [1].into();
        let err = choose(
            &candidates,
            Mode::ChatCompletions,
            &HashMap::new(),
            &ignore,
            always,
        )
        .unwrap_err();
        assert_eq!(err, SelectError::ChannelsExhausted);
    }

    #[test]
    fn selection_respects_eligibility() {
        // property: every result is enabled, supported, and not ignored
        let candidates = vec![
            channel(1, 0, ChannelStatus::Enabled),
            channel(2, 0, ChannelStatus::Disabled),
            channel(3, 0, ChannelStatus::Enabled),
            channel(4, 0, ChannelStatus::Enabled),
        ];
        let ignore: HashSet<i32> = [3].into();
        let supports = |c: &Channel, _: Mode| c.id != 4;

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let picked = choose_with_rng(
                &candidates,
                Mode::ChatCompletions,
                &HashMap::new(),
                &ignore,
                supports,
                &mut rng,
            )
            .unwrap();
            assert_eq!(picked.id, 1);
        }
    }

    #[test]
    fn higher_error_rate_never_increases_selection_probability() {
        let candidates = vec![
            channel(1, 10, ChannelStatus::Enabled),
            channel(2, 10, ChannelStatus::Enabled),
        ];

        let count_picks_of_1 = |rate_of_1: f64| {
            let rates: HashMap<i32, f64> = [(1, rate_of_1)].into();
            let mut rng = StdRng::seed_from_u64(42);
            (0..4000)
                .filter(|_| {
                    choose_with_rng(
                        &candidates,
                        Mode::ChatCompletions,
                        &rates,
                        &HashSet::new(),
                        always,
                        &mut rng,
                    )
                    .unwrap()
                    .id == 1
                })
                .count()
        };

        let healthy = count_picks_of_1(0.0);
        let degraded = count_picks_of_1(0.5);
        let broken = count_picks_of_1(1.0);
        assert!(healthy > degraded, "{healthy} vs {degraded}");
        assert!(degraded > broken, "{degraded} vs {broken}");
    }

    #[test]
    fn zero_priority_behaves_like_default_ten() {
        let explicit = vec![
            channel(1, 10, ChannelStatus::Enabled),
            channel(2, 30, ChannelStatus::Enabled),
        ];
        let defaulted = vec![
            channel(1, 0, ChannelStatus::Enabled),
            channel(2, 30, ChannelStatus::Enabled),
        ];

        let picks = |candidates: &[Arc<Channel>]| {
            let mut rng = StdRng::seed_from_u64(11);
            (0..4000)
                .filter(|_| {
                    choose_with_rng(
                        candidates,
                        Mode::ChatCompletions,
                        &HashMap::new(),
                        &HashSet::new(),
                        always,
                        &mut rng,
                    )
                    .unwrap()
                    .id == 1
                })
                .count()
        };

        // same seed, same weights -> identical draw sequence
        assert_eq!(picks(&explicit), picks(&defaulted));
    }
}
