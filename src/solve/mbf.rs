//! Multi-beam former calibration.
//!
//! Each port `j` of the beamformer is multiplied by a constant `c_j` before
//! the beams are formed. The cross-power of the reference port with port `j`
//! is `x_j = Y_ref * conj(Y_j)` and its power is `p_j = |Y_j|^2`. Multiplying
//! the current constant of port `j` by `x_j / p_j` makes the port equal to the
//! reference port.

use num_complex::Complex64;

/// Computes the port coefficients `x / p`.
///
/// A port without power gets a zero coefficient.
pub fn port_coefficients(cross: &[Complex64], powers: &[f64]) -> Vec<Complex64> {
    cross
        .iter()
        .zip(powers.iter())
        .map(|(&x, &p)| {
            if p > 0.0 {
                x / p
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
        .collect()
}

/// Applies the port coefficients to the constants currently loaded.
pub fn update_constants(current: &[Complex64], coefficients: &[Complex64]) -> Vec<Complex64> {
    current
        .iter()
        .zip(coefficients.iter())
        .map(|(c, k)| c * k)
        .collect()
}

/// Residual of a port after calibration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Residual {
    /// Magnitude of `x / p`.
    pub magnitude: f64,
    /// Phase of `x / p` in degrees.
    pub phase_deg: f64,
}

/// Computes the residuals `x / p` of the ports after calibration.
///
/// For a calibrated beamformer every residual is close to `1∠0`.
pub fn residuals(cross: &[Complex64], powers: &[f64]) -> Vec<Residual> {
    port_coefficients(cross, powers)
        .into_iter()
        .map(|r| Residual {
            magnitude: r.norm(),
            phase_deg: r.arg().to_degrees(),
        })
        .collect()
}

/// Largest deviation of the residuals from `1∠0`, as `(magnitude, degrees)`.
pub fn max_deviation(residuals: &[Residual]) -> (f64, f64) {
    residuals.iter().fold((0.0, 0.0), |(m, p), r| {
        (
            f64::max(m, (r.magnitude - 1.0).abs()),
            f64::max(p, r.phase_deg.abs()),
        )
    })
}
