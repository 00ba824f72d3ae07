//! ADC delay estimation.
//!
//! Two ADCs sampling the same signal with a relative delay of `τ` samples see
//! ratios `b[k] / a[k] = exp(-2πj * f[k] * τ / Fs)`. The delay is recovered
//! either from the slope of the unwrapped phase of these ratios across
//! frequency, or in the time domain from the peak of the cross-correlation of
//! two snapshots captured on the same clock.

use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Unwraps a phase sequence.
///
/// Multiples of `2π` are added so that consecutive phases never differ by
/// more than `π`.
pub fn unwrap(phases: &[f64]) -> Vec<f64> {
    let mut offset = 0.0;
    let mut out = Vec::with_capacity(phases.len());
    for (j, &p) in phases.iter().enumerate() {
        if j > 0 {
            let delta = p - phases[j - 1];
            offset -= 2.0 * PI * ((delta + PI) / (2.0 * PI)).floor();
        }
        out.push(p + offset);
    }
    out
}

/// Least-squares fit of a line `y = slope * x + intercept`.
///
/// Returns `(slope, intercept)`. With fewer than two distinct `x` the slope
/// is zero.
pub fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len().min(y.len()) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let (sxy, sxx) = x
        .iter()
        .zip(y.iter())
        .fold((0.0, 0.0), |(sxy, sxx), (&x, &y)| {
            (sxy + (x - mean_x) * (y - mean_y), sxx + (x - mean_x).powi(2))
        });
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    (slope, mean_y - slope * mean_x)
}

/// Estimates the delay of `b` with respect to `a` from the ratios `b / a`.
///
/// `freqs` are the frequencies of the ratios and `fs` the sample rate, both in
/// MHz. The result is `round(-slope * Fs / 2π)` samples, where `slope` is the
/// slope of the unwrapped phase in radians per MHz. It is positive when `b`
/// lags `a`.
pub fn estimate_delay(freqs: &[f64], ratios: &[Complex64], fs: f64) -> i64 {
    let phases: Vec<f64> = ratios.iter().map(|r| r.arg()).collect();
    let (slope, _) = linear_fit(freqs, &unwrap(&phases));
    (-slope * fs / (2.0 * PI)).round() as i64
}

/// Estimates the lag of `b` with respect to `a` by cross-correlation.
///
/// The result is the lag `L` maximizing `sum_n a[n] * b[n + L]`, so that it
/// is positive when `b[n] = a[n - L]`.
pub fn estimate_lag(a: &[f64], b: &[f64]) -> i64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 0;
    }
    let n = (2 * len).next_power_of_two();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);
    let spectrum = |x: &[f64]| {
        let mut buffer: Vec<Complex64> = x
            .iter()
            .map(|&x| Complex64::new(x, 0.0))
            .chain(std::iter::repeat(Complex64::new(0.0, 0.0)))
            .take(n)
            .collect();
        forward.process(&mut buffer);
        buffer
    };
    let sa = spectrum(a);
    let sb = spectrum(b);
    let mut corr: Vec<Complex64> = sa.iter().zip(sb.iter()).map(|(a, b)| a.conj() * b).collect();
    inverse.process(&mut corr);
    let peak = corr
        .iter()
        .enumerate()
        .max_by(|(_, x), (_, y)| x.re.total_cmp(&y.re))
        .map(|(j, _)| j)
        .unwrap_or(0);
    if peak > n / 2 {
        peak as i64 - n as i64
    } else {
        peak as i64
    }
}

/// Computes the ADC delays that align all the ADCs.
///
/// `current` are the delays currently applied and `lags` the lag of each ADC
/// with respect to the reference (zero for the reference itself). The ADCs
/// that are ahead are delayed to match the one lagging most, and the result
/// is offset so that the smallest delay is zero.
pub fn align_delays(current: &[i64], lags: &[i64]) -> Vec<i64> {
    let max_lag = lags.iter().copied().max().unwrap_or(0);
    let delays: Vec<i64> = current
        .iter()
        .zip(lags.iter())
        .map(|(&d, &lag)| d + max_lag - lag)
        .collect();
    let min = delays.iter().copied().min().unwrap_or(0);
    delays.into_iter().map(|d| d - min).collect()
}
