//! Simulated receivers.
//!
//! This module contains the analog and digital models of the receivers that
//! the simulated ROACH digitizes. Each acquisition builds time-domain frames
//! holding the tones of the scene plus seeded Gaussian noise, transforms them
//! with an FFT, and applies the per-channel model of the receiver and of the
//! DSP blocks programmed with the coefficients and phasors of the design.

use super::scene::{Sideband, Tone, FULL_SCALE};
use crate::solve::beam;
use num_complex::Complex64;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use roachcal_json::{ArrayInfo, SimInfo, SimModel};
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Accumulated powers and cross-powers of an acquisition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Acquisition {
    /// Power of each receiver input.
    pub inputs: Vec<Vec<f64>>,
    /// Power of each synthesized output.
    pub outputs: Vec<Vec<f64>>,
    /// Cross-power rows.
    pub cross: Vec<Vec<Complex64>>,
}

/// Programmable state of the DSP blocks.
#[derive(Debug, Clone, Default)]
pub struct Dsp {
    /// Coefficient rows, one value per channel.
    pub consts: Vec<Vec<Complex64>>,
    /// Beamformer phasor of each input.
    pub weights: Vec<Complex64>,
    /// Delay of each input in samples.
    pub delays: Vec<i64>,
}

/// Simulated receiver.
#[derive(Debug, Clone)]
pub struct Receiver {
    info: SimInfo,
    bw: f64,
    nchannels: usize,
    num_inputs: usize,
    ref_port: usize,
    // complex gain of each beamformer element towards the source
    element_gains: Vec<Complex64>,
}

fn db_to_amplitude(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

fn polar_db(db: f64, deg: f64) -> Complex64 {
    Complex64::from_polar(db_to_amplitude(db), deg.to_radians())
}

impl Receiver {
    /// Creates a receiver model.
    ///
    /// `num_inputs` is the number of ADC inputs for the ADC model. The other
    /// models have a fixed number of inputs or take it from the array.
    pub fn new(
        info: &SimInfo,
        bw: f64,
        nchannels: usize,
        num_inputs: usize,
        array: Option<&ArrayInfo>,
    ) -> Receiver {
        let (element_gains, ref_port) = match array {
            Some(array) if info.model == SimModel::Beamformer => {
                let positions = beam::element_positions(array);
                let wavelength = beam::wavelength(array.speed, array.freq);
                let k = beam::wavenumber(info.source_az, info.source_el, wavelength);
                let gains = positions
                    .iter()
                    .enumerate()
                    .map(|(j, p)| {
                        let port = polar_db(
                            info.port_gains_db.get(j).copied().unwrap_or(0.0),
                            info.port_phases_deg.get(j).copied().unwrap_or(0.0),
                        );
                        port * Complex64::from_polar(1.0, -beam::dot(&k, p))
                    })
                    .collect();
                (gains, array.ref_port)
            }
            _ => (Vec::new(), 0),
        };
        let num_inputs = match info.model {
            SimModel::Sideband | SimModel::Balanced => 2,
            SimModel::Adc => num_inputs.max(2),
            SimModel::Beamformer => element_gains.len(),
        };
        Receiver {
            info: info.clone(),
            bw,
            nchannels: nchannels.max(1),
            num_inputs,
            ref_port,
            element_gains,
        }
    }

    /// Number of receiver inputs.
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Number of spectral channels.
    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    /// Neutral coefficient of the model, used before any coefficient is
    /// written.
    pub fn neutral_const(&self) -> Complex64 {
        match self.info.model {
            SimModel::Sideband => Complex64::new(0.0, 0.0),
            _ => Complex64::new(1.0, 0.0),
        }
    }

    /// Cross-power row pairs `(reference, other)`.
    ///
    /// For the beamformer there is one row per element, cross-correlated with
    /// the reference port. For the other models the first input is the
    /// reference and there is one row per other input.
    pub fn cross_pairs(&self) -> Vec<(usize, usize)> {
        match self.info.model {
            SimModel::Beamformer => (0..self.num_inputs).map(|j| (self.ref_port, j)).collect(),
            _ => (1..self.num_inputs).map(|j| (0, j)).collect(),
        }
    }

    fn frame_len(&self) -> usize {
        2 * self.nchannels
    }

    fn sample_rate(&self) -> f64 {
        2.0 * self.bw
    }

    fn noise_sigma(&self) -> f64 {
        FULL_SCALE * db_to_amplitude(self.info.noise_db)
    }

    fn common_noise_sigma(&self) -> f64 {
        let db = self.info.common_noise_db.unwrap_or(match self.info.model {
            SimModel::Adc => -10.0,
            SimModel::Balanced => 0.0,
            _ => f64::NEG_INFINITY,
        });
        FULL_SCALE * db_to_amplitude(db)
    }

    fn tone_sample(&self, tones: &[&Tone], t: f64) -> f64 {
        tones
            .iter()
            .map(|tone| tone.amplitude * (2.0 * PI * tone.freq * t / self.sample_rate()).cos())
            .sum()
    }

    // Spectrum of a frame holding `tones` plus noise.
    fn frame(
        &self,
        fft: &Arc<dyn Fft<f64>>,
        tones: &[&Tone],
        sigma: f64,
        start: u64,
        rng: &mut StdRng,
    ) -> Vec<Complex64> {
        let mut buffer: Vec<Complex64> = (0..self.frame_len())
            .map(|n| {
                let noise: f64 = rng.sample(StandardNormal);
                Complex64::new(
                    self.tone_sample(tones, (start + n as u64) as f64) + sigma * noise,
                    0.0,
                )
            })
            .collect();
        fft.process(&mut buffer);
        buffer.truncate(self.nchannels);
        buffer
    }

    fn spectrum(fft: &Arc<dyn Fft<f64>>, samples: &[f64], nchannels: usize) -> Vec<Complex64> {
        let mut buffer: Vec<Complex64> = samples.iter().map(|&x| Complex64::new(x, 0.0)).collect();
        fft.process(&mut buffer);
        buffer.truncate(nchannels);
        buffer
    }

    /// Time series seen by every ADC input.
    ///
    /// Input `j` sees the common signal delayed by `delays[j]` samples
    /// plus its own noise. The series starts at sample time `t0`.
    pub fn time_series(&self, tones: &[Tone], delays: &[i64], t0: u64, len: usize) -> Vec<Vec<f64>> {
        let delay = |j: usize| delays.get(j).copied().unwrap_or(0);
        let dmin = (0..self.num_inputs).map(delay).min().unwrap_or(0);
        let dmax = (0..self.num_inputs).map(delay).max().unwrap_or(0);
        let mut rng =
            StdRng::seed_from_u64(self.info.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ t0);
        // common noise covering sample times [t0 - dmax, t0 + len - dmin)
        let sigma_common = self.common_noise_sigma();
        let common: Vec<f64> = (0..len + (dmax - dmin) as usize)
            .map(|_| sigma_common * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let sigma = self.noise_sigma();
        let tones: Vec<&Tone> = tones.iter().collect();
        (0..self.num_inputs)
            .map(|j| {
                let d = delay(j);
                let offset = (dmax - d) as usize;
                (0..len)
                    .map(|n| {
                        let t = t0 as f64 + n as f64 - d as f64;
                        let noise: f64 = rng.sample(StandardNormal);
                        self.tone_sample(&tones, t) + common[n + offset] + sigma * noise
                    })
                    .collect()
            })
            .collect()
    }

    /// Computes an acquisition.
    ///
    /// The same seed is used for every acquisition, so two acquisitions of
    /// the same scene with the same DSP state are identical.
    pub fn acquire(&self, tones: &[Tone], dsp: &Dsp) -> Acquisition {
        let m = self.frame_len();
        let n = self.nchannels;
        let fft = FftPlanner::new().plan_fft_forward(m);
        let mut rng = StdRng::seed_from_u64(self.info.seed);
        let konst = |row: usize, k: usize| {
            dsp.consts
                .get(row)
                .and_then(|c| c.get(k))
                .copied()
                .unwrap_or_else(|| self.neutral_const())
        };
        let num_outputs = match self.info.model {
            SimModel::Sideband => 2,
            SimModel::Balanced | SimModel::Beamformer => 1,
            SimModel::Adc => 0,
        };
        let pairs = self.cross_pairs();
        let mut acq = Acquisition {
            inputs: vec![vec![0.0; n]; self.num_inputs],
            outputs: vec![vec![0.0; n]; num_outputs],
            cross: vec![vec![Complex64::new(0.0, 0.0); n]; pairs.len()],
        };
        let all: Vec<&Tone> = tones.iter().collect();
        let sigma = self.noise_sigma();

        for frame in 0..self.info.frames.max(1) {
            let start = (frame * m) as u64;
            let (inputs, outputs): (Vec<Vec<Complex64>>, Vec<Vec<Complex64>>) =
                match self.info.model {
                    SimModel::Sideband => {
                        let usb: Vec<&Tone> =
                            all.iter().copied().filter(|t| t.sideband == Sideband::Upper).collect();
                        let lsb: Vec<&Tone> =
                            all.iter().copied().filter(|t| t.sideband == Sideband::Lower).collect();
                        let u = self.frame(&fft, &usb, sigma, start, &mut rng);
                        let l = self.frame(&fft, &lsb, sigma, start, &mut rng);
                        let leak = polar_db(self.info.leakage_db, self.info.leakage_deg);
                        let a: Vec<Complex64> = (0..n).map(|k| u[k] + leak * l[k]).collect();
                        let b: Vec<Complex64> =
                            (0..n).map(|k| l[k] + leak.conj() * u[k]).collect();
                        let usb_out: Vec<Complex64> = (0..n).map(|k| a[k] + konst(0, k) * b[k]).collect();
                        let lsb_out: Vec<Complex64> = (0..n).map(|k| konst(1, k) * a[k] + b[k]).collect();
                        (vec![a, b], vec![usb_out, lsb_out])
                    }
                    SimModel::Balanced => {
                        let rf: Vec<&Tone> = all
                            .iter()
                            .copied()
                            .filter(|t| t.role == super::scene::Role::Rf)
                            .collect();
                        let test: Vec<&Tone> = all
                            .iter()
                            .copied()
                            .filter(|t| t.role == super::scene::Role::Test)
                            .collect();
                        // rf tone and common noise reach the inputs in quadrature
                        let x = self.frame(&fft, &rf, self.common_noise_sigma(), start, &mut rng);
                        let s = self.frame(&fft, &test, 0.0, start, &mut rng);
                        let na = self.frame(&fft, &[], sigma, start, &mut rng);
                        let nb = self.frame(&fft, &[], sigma, start, &mut rng);
                        let path = Complex64::i()
                            * polar_db(self.info.imbalance_db, self.info.imbalance_deg);
                        let a: Vec<Complex64> = (0..n).map(|k| x[k] + s[k] + na[k]).collect();
                        let b: Vec<Complex64> =
                            (0..n).map(|k| path * x[k] + s[k] + nb[k]).collect();
                        let out: Vec<Complex64> = (0..n).map(|k| a[k] + konst(0, k) * b[k]).collect();
                        (vec![a, b], vec![out])
                    }
                    SimModel::Adc => {
                        let series = self.time_series(tones, &dsp.delays, start, m);
                        let inputs: Vec<Vec<Complex64>> = series
                            .iter()
                            .map(|x| Self::spectrum(&fft, x, n))
                            .collect();
                        (inputs, Vec::new())
                    }
                    SimModel::Beamformer => {
                        let t = self.frame(&fft, &all, 0.0, start, &mut rng);
                        let inputs: Vec<Vec<Complex64>> = self
                            .element_gains
                            .iter()
                            .enumerate()
                            .map(|(j, &g)| {
                                let noise = self.frame(&fft, &[], sigma, start, &mut rng);
                                (0..n).map(|k| konst(j, k) * (g * t[k] + noise[k])).collect()
                            })
                            .collect();
                        let beam: Vec<Complex64> = (0..n)
                            .map(|k| {
                                inputs
                                    .iter()
                                    .enumerate()
                                    .map(|(j, y)| {
                                        dsp.weights.get(j).copied().unwrap_or(Complex64::new(1.0, 0.0))
                                            * y[k]
                                    })
                                    .sum::<Complex64>()
                            })
                            .collect();
                        (inputs, vec![beam])
                    }
                };
            for (acc, x) in acq.inputs.iter_mut().zip(inputs.iter()) {
                for (p, z) in acc.iter_mut().zip(x.iter()) {
                    *p += z.norm_sqr();
                }
            }
            for (acc, x) in acq.outputs.iter_mut().zip(outputs.iter()) {
                for (p, z) in acc.iter_mut().zip(x.iter()) {
                    *p += z.norm_sqr();
                }
            }
            for (acc, &(r, j)) in acq.cross.iter_mut().zip(pairs.iter()) {
                for (k, c) in acc.iter_mut().enumerate() {
                    *c += inputs[r][k] * inputs[j][k].conj();
                }
            }
        }
        acq
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::scene::Role;

    fn tone(freq: f64, sideband: Sideband) -> Tone {
        Tone {
            role: Role::Rf,
            freq,
            amplitude: FULL_SCALE * 0.1,
            sideband,
        }
    }

    #[test]
    fn sideband_leakage_ratio() {
        let info = SimInfo {
            noise_db: f64::NEG_INFINITY,
            ..SimInfo::default()
        };
        let receiver = Receiver::new(&info, 1000.0, 64, 2, None);
        // channel 8 is at 125 MHz
        let acq = receiver.acquire(&[tone(125.0, Sideband::Upper)], &Dsp::default());
        let ratio = acq.inputs[1][8] / acq.inputs[0][8];
        approx::assert_abs_diff_eq!(10.0 * ratio.log10(), -20.0, epsilon = 1e-9);
        // with zero coefficients the USB output is input a
        approx::assert_relative_eq!(acq.outputs[0][8], acq.inputs[0][8]);
        assert_eq!(acq, receiver.acquire(&[tone(125.0, Sideband::Upper)], &Dsp::default()));
    }

    #[test]
    fn balanced_inputs_in_quadrature() {
        let info = SimInfo {
            model: SimModel::Balanced,
            noise_db: f64::NEG_INFINITY,
            ..SimInfo::default()
        };
        let receiver = Receiver::new(&info, 1000.0, 64, 2, None);
        let acq = receiver.acquire(&[], &Dsp::default());
        let (aa, bb, ab) = (acq.inputs[0][8], acq.inputs[1][8], acq.cross[0][8]);
        // -ab/bb undoes the second path exactly
        let c = -ab / bb;
        let expected = polar_db(-0.5, 85.0);
        approx::assert_abs_diff_eq!(c.re, expected.re, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(c.im, expected.im, epsilon = 1e-9);
        // with the neutral coefficient the output only carries the imbalance term
        let g = db_to_amplitude(0.5);
        let ratio = acq.outputs[0][8] / (aa + bb);
        let residual = 1.0 - 2.0 * g * 5f64.to_radians().sin() / (1.0 + g * g);
        approx::assert_relative_eq!(ratio, residual, max_relative = 1e-9);
        assert!(10.0 * ratio.log10() > -0.5);
    }

    #[test]
    fn adc_delay_phase() {
        let info = SimInfo {
            model: SimModel::Adc,
            common_noise_db: Some(f64::NEG_INFINITY),
            noise_db: f64::NEG_INFINITY,
            ..SimInfo::default()
        };
        let receiver = Receiver::new(&info, 1000.0, 64, 2, None);
        let dsp = Dsp {
            delays: vec![0, 3],
            ..Dsp::default()
        };
        let acq = receiver.acquire(&[tone(125.0, Sideband::Upper)], &dsp);
        // b[n] = a[n - 3] gives b/a = exp(-j 2 pi f 3 / Fs)
        let ratio = acq.cross[0][8].conj() / acq.inputs[0][8];
        let expected = -2.0 * PI * 125.0 * 3.0 / 2000.0;
        approx::assert_abs_diff_eq!(ratio.arg(), expected, epsilon = 1e-6);
    }

    #[test]
    fn time_series_share_common_noise() {
        let info = SimInfo {
            model: SimModel::Adc,
            noise_db: f64::NEG_INFINITY,
            ..SimInfo::default()
        };
        let receiver = Receiver::new(&info, 1000.0, 64, 2, None);
        let x = receiver.time_series(&[], &[0, 5], 100, 50);
        for n in 5..50 {
            assert_eq!(x[1][n], x[0][n - 5]);
        }
    }
}
