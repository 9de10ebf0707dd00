//! Small set of pure indicator functions over price series.
//!
//! Outputs are aligned with their input: positions before the first full
//! window hold NaN so metadata columns keep the dataframe length invariant.

use vela_core::Series;

/// Simple moving average over `period` bars.
#[must_use]
pub fn sma(values: &Series<f64>, period: usize) -> Series<f64> {
    let data = values.values();
    let mut out = Vec::with_capacity(data.len());
    let mut running = 0.0;
    for (index, value) in data.iter().enumerate() {
        running += value;
        if index + 1 < period {
            out.push(f64::NAN);
            continue;
        }
        if index + 1 > period {
            running -= data[index + 1 - period - 1];
        }
        out.push(running / period as f64);
    }
    out.into()
}

/// Exponential moving average with smoothing `2 / (period + 1)`, seeded by
/// the SMA of the first window.
#[must_use]
pub fn ema(values: &Series<f64>, period: usize) -> Series<f64> {
    let data = values.values();
    let mut out = Vec::with_capacity(data.len());
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut previous = f64::NAN;
    for (index, value) in data.iter().enumerate() {
        if index + 1 < period {
            out.push(f64::NAN);
            continue;
        }
        let current = if index + 1 == period {
            data[..period].iter().sum::<f64>() / period as f64
        } else {
            (value - previous) * alpha + previous
        };
        out.push(current);
        previous = current;
    }
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_matches_hand_computation() {
        let values: Series<f64> = vec![1.0, 2.0, 3.0, 4.0, 5.0].into();
        let out = sma(&values, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 3.0);
        assert_eq!(out[4], 4.0);
    }

    #[test]
    fn ema_seeds_with_sma_then_smooths() {
        let values: Series<f64> = vec![1.0, 2.0, 3.0, 4.0].into();
        let out = ema(&values, 3);
        assert!(out[0].is_nan());
        assert_eq!(out[2], 2.0);
        // alpha = 0.5: (4 - 2) * 0.5 + 2
        assert_eq!(out[3], 3.0);
    }

    #[test]
    fn constant_series_is_a_fixed_point() {
        let values: Series<f64> = vec![7.0; 10].into();
        for out in [sma(&values, 4), ema(&values, 4)] {
            assert!(out.values()[3..].iter().all(|v| (v - 7.0).abs() < 1e-12));
        }
    }
}
