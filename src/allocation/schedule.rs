use std::time::Duration;

use rand::Rng;

use crate::error::{PilotError, Result};

/// Produces jittered offsets inside `[0, window)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleGenerator;

impl ScheduleGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Draw `count` independent uniform offsets in `[0, window)`, sorted ascending.
    ///
    /// Callers assign the sorted offsets to units through their own permutation;
    /// the ascending order exists for replay and debugging only.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        count: usize,
        window: Duration,
        rng: &mut R,
    ) -> Result<Vec<Duration>> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Err(PilotError::InvalidAllocationConfig(
                "schedule window must be at least 1ms".into(),
            ));
        }

        let mut offsets: Vec<u64> = (0..count).map(|_| rng.gen_range(0..window_ms)).collect();
        offsets.sort_unstable();
        Ok(offsets.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn test_offsets_within_window() {
        let window = Duration::from_secs(26 * 60);
        for seed in 0..20u64 {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let offsets = ScheduleGenerator::new()
                .generate(100, window, &mut rng)
                .unwrap();
            assert_eq!(offsets.len(), 100);
            assert!(offsets.iter().all(|o| *o < window));
            assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_one_millisecond_window() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let offsets = ScheduleGenerator::new()
            .generate(5, Duration::from_millis(1), &mut rng)
            .unwrap();
        assert!(offsets.iter().all(|o| o.is_zero()));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        assert!(
            ScheduleGenerator::new()
                .generate(5, Duration::ZERO, &mut rng)
                .is_err()
        );
    }

    #[test]
    fn test_same_stream_does_not_repeat() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let generator = ScheduleGenerator::new();
        let first = generator
            .generate(50, Duration::from_secs(600), &mut rng)
            .unwrap();
        let second = generator
            .generate(50, Duration::from_secs(600), &mut rng)
            .unwrap();
        assert_ne!(first, second);
    }
}
