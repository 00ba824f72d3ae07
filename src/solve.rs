//! Calibration solvers.
//!
//! This module contains the pure numerical parts of the calibration
//! procedures. The solvers take the powers and cross-powers read from the FPGA
//! as plain arrays and return the corrections to be written back. They do not
//! perform any I/O.

pub mod balance;
pub mod beam;
pub mod delay;
pub mod mbf;
pub mod sideband;

/// Converts linear power ratios to dB.
pub fn to_db(x: &[f64]) -> Vec<f64> {
    x.iter().map(|x| 10.0 * x.log10()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn db() {
        let db = to_db(&[1.0, 100.0, 0.1]);
        approx::assert_abs_diff_eq!(db[0], 0.0);
        approx::assert_abs_diff_eq!(db[1], 20.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(db[2], -10.0, epsilon = 1e-12);
        assert_eq!(to_db(&[0.0]), vec![f64::NEG_INFINITY]);
    }
}
