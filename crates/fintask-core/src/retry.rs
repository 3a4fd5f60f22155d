use crate::{DEFAULT_BASE_BACKOFF_SECS, DEFAULT_MAX_BACKOFF_SECS};

/// Exponential backoff with jitter applied by `Fail`, `Timeout` and
/// `ReapStale`: `min(base * 2^attempts, cap)`, then
/// jittered by up to `jitter_fraction` in either direction.
///
/// `attempts` is the attempt count *before* the retry being scheduled
/// (i.e. the number of times the job has already run).
pub fn backoff(attempts: u32, base_secs: u64, max_secs: u64, jitter_fraction: f64) -> u64 {
    let exp = attempts.min(32); // avoid overflow on 2^attempts
    let raw = base_secs.saturating_mul(1u64 << exp);
    let capped = raw.min(max_secs);

    if jitter_fraction <= 0.0 {
        return capped;
    }

    let jitter_fraction = jitter_fraction.min(1.0);
    let span = (capped as f64 * jitter_fraction).round() as i64;
    if span <= 0 {
        return capped;
    }
    let delta = fastrand::i64(-span..=span);
    (capped as i64 + delta).max(0) as u64
}

/// `backoff` using the documented defaults (base 30s, cap 30min, no
/// jitter) — convenient for backends that don't expose jitter config.
pub fn default_backoff(attempts: u32) -> u64 {
    backoff(attempts, DEFAULT_BASE_BACKOFF_SECS, DEFAULT_MAX_BACKOFF_SECS, 0.0)
}

/// Backoff/cap/jitter knobs, configurable (`retry.*`).
#[derive(Debug, Clone, Copy)]
pub struct RetryParams {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            base_backoff_secs: DEFAULT_BASE_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryParams {
    pub fn next_delay_secs(&self, attempts: u32) -> u64 {
        backoff(
            attempts,
            self.base_backoff_secs,
            self.max_backoff_secs,
            self.jitter_fraction,
        )
    }
}

/// What the retry rule decides for a job whose current attempt just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// `attempts < max_attempts`: requeue as `Pending` with a backoff
    /// delay, clearing ownership.
    Requeue { delay_secs: u64 },
    /// Attempts exhausted: transition to the terminal state.
    Terminal,
}

/// The shared retry rule every backend adapter applies on `Fail`,
/// `Timeout`, and `ReapStale`: `attempts` here is the post-increment
/// attempt count.
pub fn retry_decision(attempts: u32, max_attempts: u32, params: &RetryParams) -> RetryDecision {
    if attempts < max_attempts {
        RetryDecision::Requeue {
            delay_secs: params.next_delay_secs(attempts),
        }
    } else {
        RetryDecision::Terminal
    }
}

#[cfg(test)]
mod retry_decision_tests {
    use super::*;

    #[test]
    fn requeues_while_attempts_remain() {
        let params = RetryParams {
            jitter_fraction: 0.0,
            ..RetryParams::default()
        };
        let decision = retry_decision(1, 3, &params);
        assert_eq!(
            decision,
            RetryDecision::Requeue {
                delay_secs: params.next_delay_secs(1)
            }
        );
    }

    #[test]
    fn goes_terminal_once_attempts_exhausted() {
        let params = RetryParams::default();
        assert_eq!(retry_decision(3, 3, &params), RetryDecision::Terminal);
        assert_eq!(retry_decision(4, 3, &params), RetryDecision::Terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_until_capped() {
        assert_eq!(backoff(0, 30, 1800, 0.0), 30);
        assert_eq!(backoff(1, 30, 1800, 0.0), 60);
        assert_eq!(backoff(2, 30, 1800, 0.0), 120);
        assert_eq!(backoff(3, 30, 1800, 0.0), 240);
    }

    #[test]
    fn backoff_respects_cap() {
        assert_eq!(backoff(10, 30, 1800, 0.0), 1800);
        assert_eq!(backoff(40, 30, 1800, 0.0), 1800);
    }

    #[test]
    fn jitter_stays_within_fraction_of_capped_value() {
        let capped = backoff(5, 30, 1800, 0.0); // 960
        for _ in 0..200 {
            let jittered = backoff(5, 30, 1800, 0.25);
            let span = (capped as f64 * 0.25).round() as i64;
            let diff = jittered as i64 - capped as i64;
            assert!(diff.abs() <= span, "jittered={jittered} capped={capped}");
        }
    }

    #[test]
    fn default_backoff_matches_documented_defaults() {
        assert_eq!(default_backoff(0), 30);
        assert_eq!(default_backoff(1), 60);
    }
}
