//! Spectral accessors.
//!
//! This module reads the accumulated power and cross-power spectra computed by
//! the FPGA through their memory descriptors, scales them by the accumulation
//! length, and converts between channels and frequencies.

use crate::{config, error::Error, fpga::Roach, memory::MemoryDesc};
use anyhow::Result;
use num_complex::Complex64;
use roachcal_json::BramNames;

/// Reads the power spectra of a descriptor.
///
/// There is one spectrum per memory, or one per interleaved group of lanes
/// when the descriptor is interleaved.
pub async fn read_power_spectra(fpga: &mut Roach, desc: &MemoryDesc) -> Result<Vec<Vec<f64>>> {
    Ok(match (desc.names(), desc.interleave()) {
        (BramNames::Name(_), _) => vec![fpga.read_memory(desc).await?],
        (BramNames::List(_), true) => vec![fpga.read_interleaved(desc).await?],
        (BramNames::List(_), false) => fpga.read_group(desc).await?,
        (BramNames::List2d(_), true) => fpga.read_group_interleaved(desc).await?,
        (BramNames::List2d(_), false) => fpga.read_group2d(desc).await?.into_iter().flatten().collect(),
    })
}

/// Reads the first power spectrum of a descriptor.
pub async fn read_power_spectrum(fpga: &mut Roach, desc: &MemoryDesc) -> Result<Vec<f64>> {
    read_power_spectra(fpga, desc)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config(format!("{}: no memories", desc.key())).into())
}

/// Reads the cross-power spectra of a descriptor.
///
/// Each `[re, im]` row of the descriptor gives one spectrum `re + j im`.
pub async fn read_cross_spectra(fpga: &mut Roach, desc: &MemoryDesc) -> Result<Vec<Vec<Complex64>>> {
    let mut spectra = Vec::new();
    for (re, im) in config::complex_rows(desc)? {
        let re = fpga.read_lanes(desc, &re).await?;
        let im = fpga.read_lanes(desc, &im).await?;
        spectra.push(
            re.into_iter()
                .zip(im)
                .map(|(re, im)| Complex64::new(re, im))
                .collect(),
        );
    }
    Ok(spectra)
}

/// Reads the first cross-power spectrum of a descriptor.
pub async fn read_cross_spectrum(fpga: &mut Roach, desc: &MemoryDesc) -> Result<Vec<Complex64>> {
    read_cross_spectra(fpga, desc)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config(format!("{}: no memories", desc.key())).into())
}

/// Reads the accumulation length of a descriptor.
///
/// A descriptor without accumulation register has an accumulation length of
/// one. A zero register value is taken as one.
pub async fn acc_len(fpga: &mut Roach, desc: &MemoryDesc) -> Result<u32> {
    Ok(match desc.acc_len_reg() {
        Some(reg) => fpga.read_reg(reg).await?.max(1),
        None => 1,
    })
}

/// Divides a spectrum by the accumulation length.
pub fn scale_linear(spec: &[f64], acc_len: u32) -> Vec<f64> {
    let acc_len = f64::from(acc_len.max(1));
    spec.iter().map(|x| x / acc_len).collect()
}

/// Converts a spectrum to dBFS as `10 log10(x / acc_len + 1) - dbfs_const`.
pub fn to_dbfs(spec: &[f64], acc_len: u32, dbfs_const: f64) -> Vec<f64> {
    scale_linear(spec, acc_len)
        .into_iter()
        .map(|x| 10.0 * (x + 1.0).log10() - dbfs_const)
        .collect()
}

/// Converts a spectrum read with `desc` to dBFS, using the current value of
/// its accumulation register.
pub async fn scale_dbfs(
    fpga: &mut Roach,
    spec: &[f64],
    desc: &MemoryDesc,
    dbfs_const: f64,
) -> Result<Vec<f64>> {
    let acc_len = acc_len(fpga, desc).await?;
    Ok(to_dbfs(spec, acc_len, dbfs_const))
}

/// Frequency in MHz of channel `k` of `n` channels spanning `bw` MHz.
pub fn channel_to_frequency(k: usize, bw: f64, n: usize) -> f64 {
    bw * k as f64 / n as f64
}

/// Channel closest to the frequency `f` in MHz.
pub fn frequency_to_channel(f: f64, bw: f64, n: usize) -> usize {
    (f * n as f64 / bw).round().max(0.0) as usize
}

/// Frequencies in MHz of all the channels.
pub fn frequencies(bw: f64, n: usize) -> Vec<f64> {
    (0..n).map(|k| channel_to_frequency(k, bw, n)).collect()
}

/// Channels `start, start + step, ...` below `stop`.
pub fn channel_grid(start: usize, stop: usize, step: usize) -> Vec<usize> {
    (start..stop).step_by(step.max(1)).collect()
}

/// Fills the `n` channels by linear interpolation of values measured at the
/// increasing channels `chnls`.
///
/// The real and imaginary parts are interpolated separately. Channels outside
/// the measured range take the value of the nearest measured channel.
pub fn interpolate_complex(chnls: &[usize], values: &[Complex64], n: usize) -> Vec<Complex64> {
    let points: Vec<(usize, Complex64)> = chnls.iter().copied().zip(values.iter().copied()).collect();
    let (first, last) = match (points.first(), points.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => return vec![Complex64::new(0.0, 0.0); n],
    };
    let mut segment = 0;
    (0..n)
        .map(|k| {
            if k <= first.0 {
                return first.1;
            }
            if k >= last.0 {
                return last.1;
            }
            while points[segment + 1].0 < k {
                segment += 1;
            }
            let (k0, v0) = points[segment];
            let (k1, v1) = points[segment + 1];
            let t = (k - k0) as f64 / (k1 - k0) as f64;
            v0 + (v1 - v0) * t
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn scaling() {
        let raw = [0.0, 99.0, 3.0e6];
        for acc_len in [1, 2, 1000] {
            let scaled = scale_linear(&raw, acc_len);
            for (s, r) in scaled.iter().zip(raw.iter()) {
                assert_eq!(*s, r / f64::from(acc_len));
            }
        }
        let db = to_dbfs(&raw, 1, 3.0);
        assert_abs_diff_eq!(db[0], -3.0);
        assert_abs_diff_eq!(db[1], 17.0, epsilon = 1e-12);
        // a zero accumulation register is taken as one
        assert_eq!(scale_linear(&raw, 0), raw.to_vec());
    }

    #[test]
    fn channels() {
        assert_eq!(channel_to_frequency(128, 1000.0, 1024), 125.0);
        assert_eq!(frequency_to_channel(125.2, 1000.0, 1024), 128);
        assert_eq!(frequency_to_channel(channel_to_frequency(77, 1080.0, 2048), 1080.0, 2048), 77);
        assert_eq!(frequencies(640.0, 4), vec![0.0, 160.0, 320.0, 480.0]);
        assert_eq!(channel_grid(1, 100, 10), vec![1, 11, 21, 31, 41, 51, 61, 71, 81, 91]);
        assert_eq!(channel_grid(0, 3, 1), vec![0, 1, 2]);
    }

    #[test]
    fn interpolation() {
        let c = |re, im| Complex64::new(re, im);
        let filled = interpolate_complex(&[2, 6], &[c(0.0, 4.0), c(4.0, 0.0)], 9);
        assert_eq!(filled.len(), 9);
        assert_eq!(filled[0], c(0.0, 4.0));
        assert_eq!(filled[2], c(0.0, 4.0));
        assert_eq!(filled[3], c(1.0, 3.0));
        assert_eq!(filled[5], c(3.0, 1.0));
        assert_eq!(filled[8], c(4.0, 0.0));
        assert_eq!(interpolate_complex(&[], &[], 2), vec![c(0.0, 0.0); 2]);
    }
}
