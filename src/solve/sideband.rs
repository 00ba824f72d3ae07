//! Sideband-separating receiver calibration.
//!
//! A sideband-separating receiver has two IF outputs `a` and `b`. The digital
//! backend synthesizes the USB output as `a + C_usb * b` and the LSB output as
//! `C_lsb * a + b`. A tone injected in the USB is seen as `a = U`, `b = r_USB *
//! U`, and a tone in the LSB as `a = r_LSB * L`, `b = L`. The ratios are
//! estimated from the powers and the cross-power `ab = a * conj(b)`, and the
//! constants are chosen to cancel the unwanted sideband at each output.

use num_complex::Complex64;
use roachcal_json::CalMethod;

/// Sideband calibration constants.
#[derive(Debug, Clone, PartialEq)]
pub struct Constants {
    /// Coefficient of the USB output (`a + C_usb * b`).
    pub usb: Vec<Complex64>,
    /// Coefficient of the LSB output (`C_lsb * a + b`).
    pub lsb: Vec<Complex64>,
}

fn ratio(num: Complex64, den: f64) -> Complex64 {
    if den > 0.0 {
        num / den
    } else {
        Complex64::new(0.0, 0.0)
    }
}

/// Computes `conj(ab) / aa` for a tone in the USB.
pub fn ratio_usb(aa: &[f64], ab: &[Complex64]) -> Vec<Complex64> {
    aa.iter()
        .zip(ab.iter())
        .map(|(&aa, ab)| ratio(ab.conj(), aa))
        .collect()
}

/// Computes `ab / bb` for a tone in the LSB.
pub fn ratio_lsb(bb: &[f64], ab: &[Complex64]) -> Vec<Complex64> {
    bb.iter()
        .zip(ab.iter())
        .map(|(&bb, &ab)| ratio(ab, bb))
        .collect()
}

/// Computes the calibration constants.
///
/// - [`CalMethod::Lsb`]: the USB output uses `-r_LSB` and the LSB output uses
///   `-r_USB`.
/// - [`CalMethod::Higher`]: both outputs use, per channel, the ratio with the
///   larger magnitude, negated.
/// - [`CalMethod::Optimal`]: both outputs use `-(w * r_USB + (1 - w) *
///   r_LSB)`, where `w` is `weight`.
pub fn constants(
    method: CalMethod,
    weight: f64,
    r_usb: &[Complex64],
    r_lsb: &[Complex64],
) -> Constants {
    match method {
        CalMethod::Lsb => Constants {
            usb: r_lsb.iter().map(|r| -r).collect(),
            lsb: r_usb.iter().map(|r| -r).collect(),
        },
        CalMethod::Higher => {
            let c: Vec<Complex64> = r_usb
                .iter()
                .zip(r_lsb.iter())
                .map(|(u, l)| if u.norm() >= l.norm() { -u } else { -l })
                .collect();
            Constants {
                usb: c.clone(),
                lsb: c,
            }
        }
        CalMethod::Optimal => {
            let c: Vec<Complex64> = r_usb
                .iter()
                .zip(r_lsb.iter())
                .map(|(&u, &l)| -(u * weight + l * (1.0 - weight)))
                .collect();
            Constants {
                usb: c.clone(),
                lsb: c,
            }
        }
    }
}

/// Computes the linear sideband-rejection ratio `wanted / unwanted`.
pub fn srr(wanted: &[f64], unwanted: &[f64]) -> Vec<f64> {
    wanted
        .iter()
        .zip(unwanted.iter())
        .map(|(&w, &u)| w / u)
        .collect()
}

/// Applies the Kerr correction to linear SRRs.
///
/// `m_dsb` is the DSB gain ratio obtained from a hot/cold load test. The USB
/// correction is `srr_usb * (srr_lsb * M - 1) / (srr_usb - M)`, and the LSB
/// correction is the same expression with the roles of the sidebands swapped
/// and `M` replaced by `1 / M`.
pub fn kerr_correction(srr_usb: &[f64], srr_lsb: &[f64], m_dsb: f64) -> (Vec<f64>, Vec<f64>) {
    let m_inv = 1.0 / m_dsb;
    srr_usb
        .iter()
        .zip(srr_lsb.iter())
        .map(|(&u, &l)| {
            (
                u * (l * m_dsb - 1.0) / (u - m_dsb),
                l * (u * m_inv - 1.0) / (l - m_inv),
            )
        })
        .unzip()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn ratios_of_leaky_receiver() {
        let leak_usb = c(0.1, 0.02);
        let leak_lsb = c(-0.05, 0.08);
        // USB tone: a = U, b = leak_usb * U
        let u = c(3.0, -4.0);
        let (a, b) = (u, leak_usb * u);
        let r_usb = ratio_usb(&[a.norm_sqr()], &[a * b.conj()]);
        assert_abs_diff_eq!((r_usb[0] - leak_usb).norm(), 0.0, epsilon = 1e-12);
        // LSB tone: a = leak_lsb * L, b = L
        let l = c(-1.0, 2.0);
        let (a, b) = (leak_lsb * l, l);
        let r_lsb = ratio_lsb(&[b.norm_sqr()], &[a * b.conj()]);
        assert_abs_diff_eq!((r_lsb[0] - leak_lsb).norm(), 0.0, epsilon = 1e-12);

        let k = constants(CalMethod::Lsb, 0.5, &r_usb, &r_lsb);
        // the USB output cancels the LSB tone and vice versa
        assert_abs_diff_eq!((a + k.usb[0] * b).norm(), 0.0, epsilon = 1e-12);
        let (a, b) = (u, leak_usb * u);
        assert_abs_diff_eq!((k.lsb[0] * a + b).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_power_gives_zero_ratio() {
        assert_eq!(ratio_usb(&[0.0], &[c(1.0, 1.0)]), vec![c(0.0, 0.0)]);
    }

    #[test]
    fn method_selection() {
        let r_usb = [c(0.3, 0.0), c(0.0, 0.1)];
        let r_lsb = [c(0.1, 0.0), c(0.0, 0.2)];
        let k = constants(CalMethod::Higher, 0.5, &r_usb, &r_lsb);
        assert_eq!(k.usb, vec![c(-0.3, 0.0), c(0.0, -0.2)]);
        assert_eq!(k.usb, k.lsb);
        let k = constants(CalMethod::Optimal, 0.25, &r_usb, &r_lsb);
        assert_abs_diff_eq!(k.usb[0].re, -(0.25 * 0.3 + 0.75 * 0.1), epsilon = 1e-15);
        assert_abs_diff_eq!(k.lsb[1].im, -(0.25 * 0.1 + 0.75 * 0.2), epsilon = 1e-15);
    }

    #[test]
    fn kerr() {
        // an ideal DSB gain ratio of 1 and infinite rejection leave the SRR as is
        let (u, l) = kerr_correction(&[1e6], &[1e6], 1.0);
        assert_abs_diff_eq!(u[0] / 1e6, 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(l[0] / 1e6, 1.0, epsilon = 1e-5);
        let (u, l) = kerr_correction(&[100.0], &[50.0], 2.0);
        assert_abs_diff_eq!(u[0], 100.0 * 99.0 / 98.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[0], 50.0 * 49.0 / 49.5, epsilon = 1e-12);
        assert_eq!(srr(&[100.0], &[0.5]), vec![200.0]);
    }
}
