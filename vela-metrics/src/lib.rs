//! Pure statistics over a slice of trade returns.
//!
//! Every function is deterministic; the bootstrap takes an explicit seed so
//! confidence intervals are reproducible across runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Arithmetic mean; 0 for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; 0 for an empty slice.
#[must_use]
pub fn stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let center = mean(values);
    let variance = values
        .iter()
        .map(|value| (value - center).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

/// Ratio of the average winning return to the absolute average losing
/// return; 0 when either side is empty.
#[must_use]
pub fn payoff(values: &[f64]) -> f64 {
    let wins: Vec<f64> = values.iter().copied().filter(|v| *v >= 0.0).collect();
    let losses: Vec<f64> = values.iter().copied().filter(|v| *v < 0.0).collect();
    if wins.is_empty() || losses.is_empty() {
        return 0.0;
    }
    mean(&wins) / mean(&losses).abs()
}

/// Gross wins divided by gross losses; 0 when there are no losses.
#[must_use]
pub fn profit_factor(values: &[f64]) -> f64 {
    let wins: f64 = values.iter().filter(|v| **v >= 0.0).sum();
    let losses: f64 = values.iter().filter(|v| **v < 0.0).sum();
    if losses == 0.0 {
        return 0.0;
    }
    wins / losses.abs()
}

/// System Quality Number: `sqrt(n) * mean / stdev`; 0 when undefined.
#[must_use]
pub fn sqn(values: &[f64]) -> f64 {
    let deviation = stdev(values);
    if values.is_empty() || deviation == 0.0 {
        return 0.0;
    }
    (values.len() as f64).sqrt() * mean(values) / deviation
}

/// Bootstrap estimate of a statistic with its confidence bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bootstrap {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Resample `values` with replacement `iterations` times, computing `measure`
/// on each resample, and report the mean plus the central `confidence`
/// interval of the sampled distribution.
#[must_use]
pub fn bootstrap<F>(
    values: &[f64],
    measure: F,
    iterations: usize,
    confidence: f64,
    seed: u64,
) -> Bootstrap
where
    F: Fn(&[f64]) -> f64,
{
    if values.is_empty() || iterations == 0 {
        return Bootstrap {
            mean: 0.0,
            lower: 0.0,
            upper: 0.0,
        };
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::with_capacity(iterations);
    let mut resample = vec![0.0; values.len()];
    for _ in 0..iterations {
        for slot in &mut resample {
            *slot = values[rng.gen_range(0..values.len())];
        }
        samples.push(measure(&resample));
    }
    samples.sort_by(|a, b| a.total_cmp(b));

    let tail = (1.0 - confidence) / 2.0;
    let lower_index = ((samples.len() as f64 * tail) as usize).min(samples.len() - 1);
    let upper_index =
        ((samples.len() as f64 * (1.0 - tail)) as usize).clamp(lower_index, samples.len() - 1);

    Bootstrap {
        mean: mean(&samples),
        lower: samples[lower_index],
        upper: samples[upper_index],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETURNS: [f64; 6] = [0.10, -0.05, 0.20, -0.10, 0.05, 0.15];

    #[test]
    fn mean_and_stdev() {
        assert!((mean(&RETURNS) - 0.058_333).abs() < 1e-5);
        assert!(stdev(&RETURNS) > 0.0);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(stdev(&[]), 0.0);
    }

    #[test]
    fn payoff_is_avg_win_over_avg_loss() {
        // avg win = 0.125, avg loss = -0.075
        assert!((payoff(&RETURNS) - 0.125 / 0.075).abs() < 1e-9);
        assert_eq!(payoff(&[0.1, 0.2]), 0.0);
    }

    #[test]
    fn profit_factor_is_gross_win_over_gross_loss() {
        assert!((profit_factor(&RETURNS) - 0.5 / 0.15).abs() < 1e-9);
        assert_eq!(profit_factor(&[0.1]), 0.0);
    }

    #[test]
    fn sqn_scales_with_sample_count() {
        let small = sqn(&RETURNS);
        let doubled: Vec<f64> = RETURNS.iter().chain(RETURNS.iter()).copied().collect();
        let large = sqn(&doubled);
        assert!(small > 0.0);
        assert!((large - small * 2.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(sqn(&[1.0, 1.0]), 0.0);
    }

    #[test]
    fn bootstrap_is_deterministic_for_a_seed() {
        let a = bootstrap(&RETURNS, mean, 1_000, 0.95, 42);
        let b = bootstrap(&RETURNS, mean, 1_000, 0.95, 42);
        assert_eq!(a, b);

        let c = bootstrap(&RETURNS, mean, 1_000, 0.95, 7);
        assert_ne!(a, c);
    }

    #[test]
    fn bootstrap_interval_brackets_the_estimate() {
        let interval = bootstrap(&RETURNS, mean, 10_000, 0.95, 42);
        assert!(interval.lower <= interval.mean);
        assert!(interval.mean <= interval.upper);
        // The sample mean should sit well inside the 95% interval.
        assert!(interval.lower < mean(&RETURNS));
        assert!(interval.upper > mean(&RETURNS));
    }

    #[test]
    fn bootstrap_handles_empty_input() {
        let interval = bootstrap(&[], mean, 100, 0.95, 1);
        assert_eq!(interval, Bootstrap { mean: 0.0, lower: 0.0, upper: 0.0 });
    }
}
