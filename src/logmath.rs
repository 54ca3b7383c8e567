//! Log-domain arithmetic with a hard floor. All scores in the decoder are
//! natural-log probabilities; `LZERO` stands in for log(0) and anything below
//! `LSMALL` is treated as zero by the add/subtract helpers. Keeping the floor
//! consistent everywhere matters: beam pruning compares scores that may have
//! been through dozens of additions and the floor stops -inf from leaking in
//! and poisoning comparisons.

/// A log probability (or a sum of them).
pub type LogFloat = f64;

/// Representation of log(0), the score of an impossible event.
pub const LZERO: LogFloat = -1.0e10;

/// Any log value below this is considered log(0) by the arithmetic helpers.
pub const LSMALL: LogFloat = -0.5e10;

/// ln(10), for converting the log10 probabilities in ARPA LM files.
pub const LN10: LogFloat = core::f64::consts::LN_10;

/// exp(x) for x below this underflows to zero anyway, so skip the call.
const MIN_LOG_EXP: LogFloat = -23.025850929940457; // -ln(-LZERO)

/// Return log(exp(x) + exp(y)), floored to `LZERO` when the sum is negligible.
pub fn log_add(x: LogFloat, y: LogFloat) -> LogFloat {
    let (hi, lo) = if x < y { (y, x) } else { (x, y) };
    let diff = lo - hi;
    if diff < MIN_LOG_EXP {
        if hi < LSMALL {
            LZERO
        } else {
            hi
        }
    } else {
        hi + (1.0 + diff.exp()).ln()
    }
}

/// Return log(exp(x) - exp(y)).
///
/// Panics if `x < y`: a negative probability is always a bug in the caller.
pub fn log_sub(x: LogFloat, y: LogFloat) -> LogFloat {
    if x < y {
        panic!("log_sub: result would be negative ({x} < {y})");
    }
    let diff = y - x;
    if diff < MIN_LOG_EXP {
        if x < LSMALL {
            LZERO
        } else {
            x
        }
    } else {
        let z = 1.0 - diff.exp();
        if z < f64::MIN_POSITIVE {
            LZERO
        } else {
            x + z.ln()
        }
    }
}

/// Convert a log probability back to a linear one, flooring tiny values to 0.
pub fn l2f(x: LogFloat) -> f64 {
    if x < LSMALL {
        0.0
    } else {
        x.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_symmetric_and_exact_for_equal_args() {
        let x = (0.25f64).ln();
        let sum = log_add(x, x);
        assert!((sum - (0.5f64).ln()).abs() < 1e-12);
        assert!((log_add(x, LZERO) - x).abs() < 1e-12);
    }

    #[test]
    fn add_floors_to_lzero() {
        assert_eq!(log_add(LZERO, LZERO), LZERO);
    }

    #[test]
    fn sub_recovers_difference() {
        let x = (0.75f64).ln();
        let y = (0.25f64).ln();
        assert!((log_sub(x, y) - (0.5f64).ln()).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn sub_panics_on_negative_result() {
        log_sub((0.25f64).ln(), (0.75f64).ln());
    }

    #[test]
    fn l2f_floors() {
        assert_eq!(l2f(LZERO), 0.0);
        assert!((l2f(0.0) - 1.0).abs() < 1e-12);
    }
}
