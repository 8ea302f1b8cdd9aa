use std::time::Duration;

use rand::Rng;

use crate::settings::BackoffSettings;

/// Jittered exponential delay generator used by the persistent streams.
///
/// The first delay after a reset is zero; subsequent delays grow by
/// `factor` from `initial_delay` up to `max_delay`. Each delay is spread by
/// `±jitter * base`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
        self.attempts = 0;
    }

    /// The next delay will be the configured maximum.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub(crate) fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = if base > 0.0 && self.settings.jitter > 0.0 {
            self.settings.jitter * base * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        self.attempts = self.attempts.saturating_add(1);
        self.current_base = if self.current_base.is_zero() {
            self.settings.initial_delay
        } else {
            self.current_base
                .mul_f64(self.settings.factor)
                .min(self.settings.max_delay)
        };
        self.current_base = self.current_base.min(self.settings.max_delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings() -> BackoffSettings {
        BackoffSettings {
            initial_delay: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }

    #[test]
    fn first_delay_is_immediate() {
        let mut backoff = ExponentialBackoff::new(settings());
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn delays_stay_within_jitter_bounds_and_cap() {
        let mut backoff = ExponentialBackoff::new(settings());
        let mut rng = StdRng::seed_from_u64(7);
        backoff.next_delay_with_rng(&mut rng);
        let mut expected_base = 1.0_f64;
        for _ in 0..20 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_secs_f64();
            assert!(delay >= expected_base * 0.5 - 1e-9);
            assert!(delay <= expected_base * 1.5 + 1e-9);
            expected_base = (expected_base * 1.5).min(60.0);
        }
    }

    #[test]
    fn reset_to_max_uses_maximum_base() {
        let mut backoff = ExponentialBackoff::new(settings());
        backoff.reset_to_max();
        let mut rng = StdRng::seed_from_u64(1);
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
