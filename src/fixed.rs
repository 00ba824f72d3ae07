//! Fixed-point codec.
//!
//! This module converts between floating point values and the signed
//! fixed-point integers used by the coefficient memories and the phasor banks
//! of the FPGA designs. Quantization never fails: values outside the
//! representable range are clamped, logged, and counted, so that the count can
//! be reported in the result manifest.

use anyhow::Result;
use num_complex::Complex64;

/// Fixed-point format.
///
/// A format is given by a total number of bits `nbits`, including the sign
/// bit, and a binary point position `binpt`. The representable range is
/// `[-2^(nbits-1), 2^(nbits-1) - 1] / 2^binpt`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Format {
    nbits: u32,
    binpt: u32,
}

impl Format {
    /// Creates a new format.
    ///
    /// The number of bits must be between 1 and 63.
    pub fn new(nbits: u32, binpt: u32) -> Result<Format> {
        anyhow::ensure!(
            (1..=63).contains(&nbits),
            "fixed-point width {nbits} out of range"
        );
        anyhow::ensure!(binpt <= 63, "binary point {binpt} out of range");
        Ok(Format { nbits, binpt })
    }

    /// Returns the number of bits.
    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    /// Returns the binary point.
    pub fn binpt(&self) -> u32 {
        self.binpt
    }

    /// Smallest representable integer.
    pub fn min_int(&self) -> i64 {
        -(1i64 << (self.nbits - 1))
    }

    /// Largest representable integer.
    pub fn max_int(&self) -> i64 {
        (1i64 << (self.nbits - 1)) - 1
    }

    /// Value of one LSB.
    pub fn lsb(&self) -> f64 {
        1.0 / self.scale()
    }

    /// Smallest representable value.
    pub fn min_value(&self) -> f64 {
        self.min_int() as f64 / self.scale()
    }

    /// Largest representable value.
    pub fn max_value(&self) -> f64 {
        self.max_int() as f64 / self.scale()
    }

    fn scale(&self) -> f64 {
        2f64.powi(self.binpt as i32)
    }

    fn in_range(&self, x: f64) -> bool {
        x >= self.min_value() && x <= self.max_value()
    }
}

/// Quantized real values.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fixed {
    /// Integer values.
    pub values: Vec<i64>,
    /// Number of values that were out of range and had to be clamped.
    pub overflows: usize,
}

/// Quantized complex values.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FixedComplex {
    /// Integer real parts.
    pub re: Vec<i64>,
    /// Integer imaginary parts.
    pub im: Vec<i64>,
    /// Number of parts that were out of range and had to be clamped.
    pub overflows: usize,
}

fn quantize(format: Format, x: f64, index: usize, overflows: &mut usize) -> i64 {
    if format.in_range(x) {
        (x * format.scale()).trunc() as i64
    } else {
        tracing::warn!(
            index,
            value = x,
            nbits = format.nbits,
            binpt = format.binpt,
            "fixed-point overflow"
        );
        *overflows += 1;
        if x > 0.0 {
            format.max_int()
        } else if x < 0.0 {
            format.min_int()
        } else {
            // NaN
            0
        }
    }
}

/// Converts real values to fixed point.
///
/// Values are multiplied by `2^binpt` and truncated toward zero. Values
/// outside the representable range produce a warning and are clamped.
pub fn to_fixed(format: Format, values: &[f64]) -> Fixed {
    let mut overflows = 0;
    let values = values
        .iter()
        .enumerate()
        .map(|(j, &x)| quantize(format, x, j, &mut overflows))
        .collect();
    Fixed { values, overflows }
}

/// Converts complex values to fixed point.
///
/// The real and imaginary parts are quantized separately as in [`to_fixed`].
pub fn to_fixed_complex(format: Format, values: &[Complex64]) -> FixedComplex {
    let mut overflows = 0;
    let (re, im) = values
        .iter()
        .enumerate()
        .map(|(j, z)| {
            (
                quantize(format, z.re, j, &mut overflows),
                quantize(format, z.im, j, &mut overflows),
            )
        })
        .unzip();
    FixedComplex { re, im, overflows }
}

/// Converts fixed-point integers to real values.
pub fn from_fixed(format: Format, values: &[i64]) -> Vec<f64> {
    values.iter().map(|&n| n as f64 / format.scale()).collect()
}

/// Converts fixed-point integer pairs to complex values.
pub fn from_fixed_complex(format: Format, re: &[i64], im: &[i64]) -> Vec<Complex64> {
    re.iter()
        .zip(im.iter())
        .map(|(&a, &b)| Complex64::new(a as f64 / format.scale(), b as f64 / format.scale()))
        .collect()
}

/// Saturates a complex value preserving its argument.
///
/// If the magnitude of the real or the imaginary part of `z` is larger than
/// the largest representable value, `z` is scaled so that its dominant part
/// becomes one LSB below the largest representable value.
/// The most negative value is also avoided so that the result can be
/// conjugated or negated without overflowing. Other values are returned
/// unchanged.
pub fn saturate_complex(format: Format, z: Complex64) -> Complex64 {
    let dominant = z.re.abs().max(z.im.abs());
    if dominant <= format.max_value() {
        return z;
    }
    // one LSB below the rail, so that rounding in the scaling cannot overflow
    let target = (format.max_int() - 1).max(0) as f64 * format.lsb();
    z * (target / dominant)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn q1_17_round_trip() {
        let format = Format::new(18, 17).unwrap();
        let q = to_fixed_complex(format, &[Complex64::new(0.5, 0.25)]);
        assert_eq!(q.re, vec![65536]);
        assert_eq!(q.im, vec![32768]);
        assert_eq!(q.overflows, 0);
        assert_eq!(
            from_fixed_complex(format, &q.re, &q.im),
            vec![Complex64::new(0.5, 0.25)]
        );
    }

    #[test]
    fn overflow_is_counted_and_clamped() {
        let format = Format::new(18, 17).unwrap();
        assert_eq!(format.min_value(), -1.0);
        assert_eq!(format.max_value(), 1.0 - 2f64.powi(-17));
        let q = to_fixed(format, &[1.0, -1.0, -1.5, 0.75, f64::NAN]);
        assert_eq!(q.values, vec![131071, -131072, -131072, 98304, 0]);
        assert_eq!(q.overflows, 3);
    }

    #[test]
    fn truncation_toward_zero() {
        let format = Format::new(8, 4).unwrap();
        let q = to_fixed(format, &[0.099, -0.099, 1.07, -1.07]);
        // 1.584 -> 1, -1.584 -> -1, 17.12 -> 17, -17.12 -> -17
        assert_eq!(q.values, vec![1, -1, 17, -17]);
    }

    #[test]
    fn round_trip_on_grid() {
        let format = Format::new(16, 10).unwrap();
        let values: Vec<f64> = (-200..200).map(|n| n as f64 * 0.078125).collect();
        let q = to_fixed(format, &values);
        assert_eq!(q.overflows, 0);
        assert_eq!(from_fixed(format, &q.values), values);
    }

    #[test]
    fn saturation_preserves_argument() {
        let format = Format::new(18, 17).unwrap();
        for z in [
            Complex64::new(1.0, 0.0),
            Complex64::new(-1.0, 0.0),
            Complex64::new(3.0, -2.0),
            Complex64::new(-0.2, 7.5),
            Complex64::from_polar(1.0, 0.3),
        ] {
            let s = saturate_complex(format, z);
            assert!(s.re.abs() <= format.max_value());
            assert!(s.im.abs() <= format.max_value());
            approx::assert_abs_diff_eq!(s.arg(), z.arg(), epsilon = 1e-12);
            assert_eq!(to_fixed_complex(format, &[s]).overflows, 0);
        }
        let z = Complex64::new(0.5, -0.5);
        assert_eq!(saturate_complex(format, z), z);
    }

    #[test]
    fn saturated_values_never_overflow() {
        let format = Format::new(18, 17).unwrap();
        let mut saturated = 0;
        for n in 0..20000 {
            let r = 1.0007 + n as f64 * 7.3e-4;
            for phase in [-0.3, 0.3, 1.0, -1.0, 3.7] {
                let z = Complex64::new(r, -r * phase);
                let s = saturate_complex(format, z);
                if s != z {
                    saturated += 1;
                    approx::assert_relative_eq!(s.arg(), z.arg(), max_relative = 1e-12);
                }
                let q = to_fixed_complex(format, &[s]);
                assert_eq!(q.overflows, 0, "{z} saturated to {s}");
            }
        }
        assert_eq!(saturated, 100000);
        // the dominant part lands one LSB below the largest value
        let s = saturate_complex(format, Complex64::new(0.0, -4.0));
        assert_eq!(to_fixed_complex(format, &[s]).im, vec![-(format.max_int() - 1)]);
    }
}
