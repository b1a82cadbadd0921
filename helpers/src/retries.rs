use rand::Rng;

/// Configuration for exponential backoff between attempts of
/// an operation that can fail transiently.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// The base delay in seconds for the first retry attempt.
    pub base_seconds: f64,
    /// The multiplier applied for each subsequent attempt.
    pub multiplier: f64,
    /// The maximum delay in seconds that backoff can grow to.
    pub cap_seconds: f64,
    /// Whether to apply full jitter, where the final wait time is
    /// drawn uniformly from [0, computed).
    /// See: https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
    pub full_jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_seconds: 2.0,
            multiplier: 2.0,
            cap_seconds: 30.0,
            full_jitter: true,
        }
    }
}

/// Calculate the wait time in milliseconds for a retry attempt,
/// where `attempt` is zero-based.
/// The un-jittered wait is `min(cap, base * multiplier^attempt)`;
/// with full jitter the result is drawn uniformly from [0, wait).
pub fn calculate_backoff_ms(config: &BackoffConfig, attempt: u32) -> u64 {
    let base_ms = config.base_seconds * 1000.0;
    let computed_ms = (base_ms * config.multiplier.powf(attempt as f64))
        .min(config.cap_seconds * 1000.0);

    if config.full_jitter && computed_ms > 0.0 {
        rand::thread_rng().gen_range(0.0..computed_ms).trunc() as u64
    } else {
        computed_ms.trunc() as u64
    }
}

/// Draw a uniform jitter value in milliseconds from [0, max_ms].
/// Used to spread the first attempt of competing workers so that
/// they do not stampede a shared resource at the same instant.
pub fn first_attempt_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;

    #[test]
    fn test_calculates_backoff_without_jitter() {
        let config = BackoffConfig {
            base_seconds: 2.0,
            multiplier: 2.0,
            cap_seconds: 30.0,
            full_jitter: false,
        };

        assert_eq!(calculate_backoff_ms(&config, 0), 2000);
        assert_eq!(calculate_backoff_ms(&config, 1), 4000);
        assert_eq!(calculate_backoff_ms(&config, 2), 8000);
        assert_eq!(calculate_backoff_ms(&config, 3), 16000);
        // 2 * 2^4 = 32 seconds exceeds the 30 second cap.
        assert_eq!(calculate_backoff_ms(&config, 4), 30000);
        assert_eq!(calculate_backoff_ms(&config, 10), 30000);
    }

    #[test_log::test]
    fn test_calculates_backoff_with_full_jitter_within_bounds() {
        let config = BackoffConfig {
            base_seconds: 3.0,
            multiplier: 2.0,
            cap_seconds: 80.0,
            full_jitter: true,
        };

        for (attempt, upper_bound) in
            [(0, 3000), (1, 6000), (2, 12000), (3, 24000), (4, 48000), (6, 80000)]
        {
            let wait = calculate_backoff_ms(&config, attempt);
            assert!(
                wait <= upper_bound,
                "attempt {attempt} produced {wait}ms, expected <= {upper_bound}ms"
            );
        }
    }

    #[test]
    fn test_first_attempt_jitter_stays_in_range() {
        for _ in 0..100 {
            assert!(first_attempt_jitter_ms(2000) <= 2000);
        }
        assert_eq!(first_attempt_jitter_ms(0), 0);
    }
}
