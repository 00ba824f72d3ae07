//! Balanced mixer calibration.
//!
//! The backend synthesizes the output of a balanced mixer as `a + c * b`. The
//! coefficient `c = -ab / bb` minimizes the output power of the components
//! that reach both inputs coherently, such as the LO noise.

use num_complex::Complex64;

/// Computes the balance coefficients `-ab / bb`.
pub fn coefficients(bb: &[f64], ab: &[Complex64]) -> Vec<Complex64> {
    bb.iter()
        .zip(ab.iter())
        .map(|(&bb, &ab)| {
            if bb > 0.0 {
                -ab / bb
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
        .collect()
}

/// Computes the power of `a + c * b` from the powers and the cross-power of
/// the inputs.
///
/// The power is `aa + |c|^2 * bb + 2 * Re(conj(c) * ab)`.
pub fn synthesized_power(aa: &[f64], bb: &[f64], ab: &[Complex64], c: &[Complex64]) -> Vec<f64> {
    aa.iter()
        .zip(bb.iter())
        .zip(ab.iter().zip(c.iter()))
        .map(|((&aa, &bb), (&ab, &c))| aa + c.norm_sqr() * bb + 2.0 * (c.conj() * ab).re)
        .collect()
}

/// Computes the cancellation in dB obtained by replacing the ideal
/// coefficient by the calibrated one.
pub fn cancellation_db(ideal: &[f64], calibrated: &[f64]) -> Vec<f64> {
    ideal
        .iter()
        .zip(calibrated.iter())
        .map(|(&i, &c)| 10.0 * (i / c).log10())
        .collect()
}
