use rand::Rng;
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PilotError, Result};

/// Per-unit bounds `[min, max]` applied to every share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountBounds {
    pub min: Decimal,
    pub max: Decimal,
}

impl AmountBounds {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// Splits a total into `N` randomized shares that sum exactly to the total.
///
/// Amounts are handled as integer ticks of the rounding unit (`10^-precision`),
/// so the last share is always the exact residual.
#[derive(Debug, Clone)]
pub struct AllocationGenerator {
    precision: u32,
    max_draw_attempts: u32,
}

impl AllocationGenerator {
    pub fn new(precision: u32, max_draw_attempts: u32) -> Self {
        Self {
            precision,
            max_draw_attempts: max_draw_attempts.max(1),
        }
    }

    /// Check `total`, `count` and `bounds` without drawing anything.
    pub fn validate(&self, total: Decimal, count: usize, bounds: AmountBounds) -> Result<()> {
        self.ticks_for(total, count, bounds).map(|_| ())
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        total: Decimal,
        count: usize,
        bounds: AmountBounds,
        rng: &mut R,
    ) -> Result<Vec<Decimal>> {
        let (total_ticks, min_ticks, max_ticks) = self.ticks_for(total, count, bounds)?;

        for attempt in 1..=self.max_draw_attempts {
            let mut shares = draw_ticks(total_ticks, count, min_ticks, max_ticks, rng);

            let sum: i128 = shares.iter().sum();
            let in_bounds = shares.iter().all(|s| (min_ticks..=max_ticks).contains(s));
            if sum != total_ticks || !in_bounds {
                debug!(attempt, "Residual share out of bounds, redrawing");
                continue;
            }

            shares.shuffle(rng);
            return Ok(shares
                .into_iter()
                .map(|t| Decimal::from_i128_with_scale(t, self.precision))
                .collect());
        }

        Err(PilotError::InvalidAllocationConfig(format!(
            "no in-bounds allocation found after {} draws",
            self.max_draw_attempts
        )))
    }

    fn ticks_for(
        &self,
        total: Decimal,
        count: usize,
        bounds: AmountBounds,
    ) -> Result<(i128, i128, i128)> {
        let invalid = |msg: String| Err(PilotError::InvalidAllocationConfig(msg));

        if count == 0 {
            return invalid("unit count must be greater than 0".into());
        }
        if total <= Decimal::ZERO {
            return invalid(format!("total must be positive, got {}", total));
        }
        if bounds.min <= Decimal::ZERO || bounds.min > bounds.max {
            return invalid(format!(
                "bounds must satisfy 0 < min <= max, got [{}, {}]",
                bounds.min, bounds.max
            ));
        }

        let total_ticks = self.to_ticks(total, "total")?;
        let min_ticks = self.to_ticks(bounds.min, "min bound")?;
        let max_ticks = self.to_ticks(bounds.max, "max bound")?;
        let n = count as i128;

        if n * min_ticks > total_ticks {
            return invalid(format!(
                "{} units x min {} exceeds total {}",
                count, bounds.min, total
            ));
        }
        if n * max_ticks < total_ticks {
            return invalid(format!(
                "{} units x max {} cannot reach total {}",
                count, bounds.max, total
            ));
        }

        Ok((total_ticks, min_ticks, max_ticks))
    }

    fn to_ticks(&self, value: Decimal, label: &str) -> Result<i128> {
        let mut scaled = value;
        scaled.rescale(self.precision);
        if scaled != value {
            return Err(PilotError::InvalidAllocationConfig(format!(
                "{} {} has more than {} decimal places",
                label, value, self.precision
            )));
        }
        Ok(scaled.mantissa())
    }
}

/// Draw `count - 1` shares from a feasible range that shrinks with every draw
/// and assign the last share the exact residual.
fn draw_ticks<R: Rng + ?Sized>(
    total: i128,
    count: usize,
    min: i128,
    max: i128,
    rng: &mut R,
) -> Vec<i128> {
    let mut shares = Vec::with_capacity(count);
    let mut remaining = total;

    for i in 0..count.saturating_sub(1) {
        let left = (count - 1 - i) as i128;
        let lo = min.max(remaining - left * max);
        let hi = max.min(remaining - left * min);
        let share = if lo >= hi { lo } else { rng.gen_range(lo..=hi) };
        shares.push(share);
        remaining -= share;
    }

    shares.push(remaining);
    shares
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rust_decimal_macros::dec;

    use super::*;

    fn generator() -> AllocationGenerator {
        AllocationGenerator::new(6, 8)
    }

    #[test]
    fn test_sum_and_bounds_hold_across_seeds() {
        let bounds = AmountBounds::new(dec!(0.016), dec!(0.048));
        for seed in 0..50u64 {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let shares = generator()
                .generate(dec!(3.20), 100, bounds, &mut rng)
                .unwrap();

            assert_eq!(shares.len(), 100);
            assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(3.20));
            assert!(shares.iter().all(|s| bounds.contains(*s)));
        }
    }

    #[test]
    fn test_tight_bounds_force_equal_shares() {
        let bounds = AmountBounds::new(dec!(0.5), dec!(0.5));
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let shares = generator()
            .generate(dec!(2.0), 4, bounds, &mut rng)
            .unwrap();
        assert!(shares.iter().all(|s| *s == dec!(0.5)));
    }

    #[test]
    fn test_single_unit_gets_total() {
        let bounds = AmountBounds::new(dec!(1), dec!(10));
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let shares = generator()
            .generate(dec!(4.25), 1, bounds, &mut rng)
            .unwrap();
        assert_eq!(shares, vec![dec!(4.25)]);
    }

    #[test]
    fn test_rejects_infeasible_bounds() {
        let g = generator();
        // 100 x 0.022 = 2.2 < 3.20
        let err = g
            .validate(dec!(3.20), 100, AmountBounds::new(dec!(0.016), dec!(0.022)))
            .unwrap_err();
        assert!(matches!(err, PilotError::InvalidAllocationConfig(_)));

        // 10 x 0.5 = 5 > 3
        assert!(
            g.validate(dec!(3), 10, AmountBounds::new(dec!(0.5), dec!(1)))
                .is_err()
        );
    }

    #[test]
    fn test_rejects_degenerate_inputs() {
        let g = generator();
        let bounds = AmountBounds::new(dec!(0.1), dec!(1));
        assert!(g.validate(dec!(0), 3, bounds).is_err());
        assert!(g.validate(dec!(1), 0, bounds).is_err());
        assert!(
            g.validate(dec!(1), 3, AmountBounds::new(dec!(0.5), dec!(0.1)))
                .is_err()
        );
        assert!(g.validate(dec!(1.0000001), 3, bounds).is_err());
    }
}
