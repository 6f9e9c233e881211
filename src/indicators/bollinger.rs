// =============================================================================
// Bollinger Bands — dual standard-deviation multipliers over one basis
// =============================================================================
//
// The strategy works with two band pairs sharing a single SMA basis: the
// "orig" multiplier (context / preconditions) and the "new" multiplier
// (entry targets). BBM is identical for both, so one window pass yields all
// five values.
//
// Closes arrive as exact decimals; the mean/σ pass runs in f64 and the band
// values are converted back with `from_f64`.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Parameters for the dual-band calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct BbParams {
    /// Basis kind. Only "SMA" is computed; anything else falls back to SMA
    /// with a warning at the call site.
    pub ma_type: String,
    pub length: usize,
    pub mult_orig: f64,
    pub mult_new: f64,
}

impl BbParams {
    pub fn new(ma_type: impl Into<String>, length: usize, mult_orig: f64, mult_new: f64) -> Self {
        Self {
            ma_type: ma_type.into(),
            length,
            mult_orig,
            mult_new,
        }
    }
}

/// The five band values for one candle.
#[derive(Debug, Clone, PartialEq)]
pub struct DualBands {
    pub bbl_orig: Decimal,
    pub bbm_orig: Decimal,
    pub bbu_orig: Decimal,
    pub bbl_new: Decimal,
    pub bbu_new: Decimal,
}

/// Calculate both band pairs over the trailing `params.length` closes.
///
/// Returns `None` when:
/// - fewer than `length` closes are available, or `length == 0`;
/// - the basis or σ degenerates to a non-finite value.
pub fn dual_bollinger(closes: &[Decimal], params: &BbParams) -> Option<DualBands> {
    let length = params.length;
    if length == 0 || closes.len() < length {
        return None;
    }

    let window: Vec<f64> = closes[closes.len() - length..]
        .iter()
        .map(|d| d.to_f64().unwrap_or(f64::NAN))
        .collect();

    let sum: f64 = window.iter().sum();
    let middle = sum / length as f64;
    if !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / length as f64;
    let std_dev = variance.sqrt();
    if !std_dev.is_finite() {
        return None;
    }

    let band = |mult: f64, up: bool| -> Option<Decimal> {
        let v = if up {
            middle + mult * std_dev
        } else {
            middle - mult * std_dev
        };
        Decimal::from_f64(v)
    };

    Some(DualBands {
        bbl_orig: band(params.mult_orig, false)?,
        bbm_orig: Decimal::from_f64(middle)?,
        bbu_orig: band(params.mult_orig, true)?,
        bbl_new: band(params.mult_new, false)?,
        bbu_new: band(params.mult_new, true)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> BbParams {
        BbParams::new("SMA", 20, 2.0, 1.0)
    }

    #[test]
    fn dual_bands_basic_shape() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let bands = dual_bollinger(&closes, &params()).unwrap();
        assert!(bands.bbu_orig > bands.bbm_orig);
        assert!(bands.bbl_orig < bands.bbm_orig);
        // The "new" multiplier is tighter than the "orig" one here.
        assert!(bands.bbu_new < bands.bbu_orig);
        assert!(bands.bbl_new > bands.bbl_orig);
        // Shared basis.
        assert!(bands.bbu_new > bands.bbm_orig);
        assert!(bands.bbl_new < bands.bbm_orig);
    }

    #[test]
    fn insufficient_data_returns_none() {
        let closes = vec![dec!(1), dec!(2), dec!(3)];
        assert!(dual_bollinger(&closes, &params()).is_none());
    }

    #[test]
    fn zero_length_returns_none() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let p = BbParams::new("SMA", 0, 2.0, 1.0);
        assert!(dual_bollinger(&closes, &p).is_none());
    }

    #[test]
    fn flat_series_collapses_bands() {
        let closes = vec![dec!(100); 20];
        let bands = dual_bollinger(&closes, &params()).unwrap();
        assert_eq!(bands.bbm_orig, dec!(100));
        assert_eq!(bands.bbl_orig, dec!(100));
        assert_eq!(bands.bbu_orig, dec!(100));
        assert_eq!(bands.bbl_new, dec!(100));
        assert_eq!(bands.bbu_new, dec!(100));
    }

    #[test]
    fn known_window_values() {
        // length 4, simple numbers: mean 2.5, population σ = sqrt(1.25)
        let closes = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        let p = BbParams::new("SMA", 4, 2.0, 1.0);
        let bands = dual_bollinger(&closes, &p).unwrap();
        let sigma = 1.25f64.sqrt();

        let bbm = bands.bbm_orig.to_f64().unwrap();
        let bbu = bands.bbu_orig.to_f64().unwrap();
        let bbl_new = bands.bbl_new.to_f64().unwrap();
        assert!((bbm - 2.5).abs() < 1e-9);
        assert!((bbu - (2.5 + 2.0 * sigma)).abs() < 1e-9);
        assert!((bbl_new - (2.5 - sigma)).abs() < 1e-9);
    }

    #[test]
    fn only_trailing_window_is_used() {
        // Leading garbage must not affect the result.
        let mut closes = vec![dec!(1000); 30];
        closes.extend(std::iter::repeat(dec!(50)).take(20));
        let bands = dual_bollinger(&closes, &params()).unwrap();
        assert_eq!(bands.bbm_orig, dec!(50));
    }
}
