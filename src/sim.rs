//! ROACH simulator.
//!
//! This module contains [`SimRoach`], an in-memory model of a ROACH running
//! one of the calibration designs. It keeps a register file and a set of block
//! memories built from the configuration, and answers memory reads by
//! simulating the receiver described in the `sim` section of the
//! configuration, fed by the simulated sources of a shared [`Scene`].
//!
//! The snapshot blocks follow the CASPER arm/trigger protocol, the phasor bank
//! commits only on a rising edge of its write-enable register, and the
//! coefficient memories hold whatever was last written to them.

use crate::{
    config::{self, Settings},
    error::Error,
    fixed::Format,
    fpga::{self, PhasorBank, CLOCK_COUNTER, CTRL_ENABLE, CTRL_MAN_TRIG, STATUS_BUSY},
    memory::{self, Dtype, Endianness, Kind, MemoryDesc, Value},
    solve::beam,
};
use num_complex::Complex64;
use roachcal_json::{ArrayInfo, BramNames, SimModel};
use std::collections::HashMap;

mod receiver;
mod scene;
mod source;

pub use receiver::{Acquisition, Dsp, Receiver};
pub use scene::{Role, Scene, Sideband, SourceState, Tone, FULL_SCALE};
pub use source::SimSource;

// spacing between the capture instants of independent snapshots
const CAPTURE_SPACING: u64 = 4099;

#[derive(Debug, Clone)]
enum Content {
    Power {
        outputs: bool,
        index: usize,
        lane: usize,
        lanes: usize,
        acc_reg: Option<String>,
    },
    Cross {
        row: usize,
        imag: bool,
        lane: usize,
        lanes: usize,
        acc_reg: Option<String>,
    },
    Stored,
    Snapshot {
        snapshot: String,
        adc: usize,
        lane: usize,
        lanes: usize,
    },
}

#[derive(Debug, Clone)]
struct Bram {
    content: Content,
    dtype: Dtype,
    data: Vec<u8>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SnapState {
    Idle,
    Armed,
    Captured(u64),
}

/// Simulated ROACH.
#[derive(Debug)]
pub struct SimRoach {
    receiver: Receiver,
    scene: Scene,
    bw: f64,
    regs: HashMap<String, u32>,
    brams: HashMap<String, Bram>,
    snapshots: HashMap<String, SnapState>,
    snap_samples: usize,
    snap_trig_reg: Option<String>,
    delay_regs: Vec<Option<String>>,
    adc_delays: Vec<i64>,
    const_rows: Vec<(Vec<String>, Vec<String>)>,
    const_format: Option<Format>,
    bank: Option<PhasorBank>,
    bank_values: HashMap<Vec<u32>, Complex64>,
    array: Option<ArrayInfo>,
    clock_mhz: f64,
    start: tokio::time::Instant,
    captures: u64,
    generation: u64,
    cache_key: Option<(u64, u64)>,
    acq: Acquisition,
    bitstream: Option<String>,
}

// (name, logical index, lane, lanes) of each memory of a power descriptor
fn power_layout(desc: &MemoryDesc) -> Vec<(String, usize, usize, usize)> {
    match (desc.names(), desc.interleave()) {
        (BramNames::Name(name), _) => vec![(name.clone(), 0, 0, 1)],
        (BramNames::List(list), true) => list
            .iter()
            .enumerate()
            .map(|(j, name)| (name.clone(), 0, j, list.len()))
            .collect(),
        (BramNames::List(list), false) => list
            .iter()
            .enumerate()
            .map(|(j, name)| (name.clone(), j, 0, 1))
            .collect(),
        (BramNames::List2d(rows), true) => rows
            .iter()
            .enumerate()
            .flat_map(|(r, row)| {
                row.iter()
                    .enumerate()
                    .map(move |(j, name)| (name.clone(), r, j, row.len()))
            })
            .collect(),
        (BramNames::List2d(rows), false) => rows
            .iter()
            .flatten()
            .enumerate()
            .map(|(j, name)| (name.clone(), j, 0, 1))
            .collect(),
    }
}

fn encode_fixed(format: Format, dtype: Dtype, x: f64, words: usize) -> Vec<u8> {
    let value = match dtype.kind {
        Kind::Float => Value::Float(x),
        _ => Value::Int((x / format.lsb()).trunc() as i128),
    };
    dtype.encode(&vec![value; words])
}

impl SimRoach {
    /// Creates a simulated ROACH for a configuration.
    ///
    /// The registers and memories of the simulated design are the ones named
    /// by the configuration.
    pub fn new(settings: &Settings, scene: Scene) -> Result<SimRoach, Error> {
        let config = &settings.config;
        let crosspow_rows = match &settings.crosspow {
            Some(desc) => config::complex_rows(desc)?.len(),
            None => 0,
        };
        let receiver = Receiver::new(
            &config.sim,
            config.bw,
            settings.nchannels(),
            config.snapshots.len().max(crosspow_rows + 1),
            config.array_info.as_ref(),
        );
        if config.sim.model == SimModel::Beamformer && receiver.num_inputs() == 0 {
            return Err(Error::Config(
                "the beamformer simulator needs array_info".to_string(),
            ));
        }

        let mut regs: HashMap<String, u32> = settings
            .register_names()
            .into_iter()
            .map(|name| (name, 0))
            .collect();
        let mut brams = HashMap::new();
        let mut power = |desc: &Option<MemoryDesc>, outputs: bool| {
            if let Some(desc) = desc {
                if let Some(reg) = desc.acc_len_reg() {
                    regs.insert(reg.to_string(), 1);
                }
                for (name, index, lane, lanes) in power_layout(desc) {
                    let content = Content::Power {
                        outputs,
                        index,
                        lane,
                        lanes,
                        acc_reg: desc.acc_len_reg().map(str::to_string),
                    };
                    brams.insert(
                        name,
                        Bram {
                            content,
                            dtype: desc.dtype(),
                            data: vec![0; desc.nbytes()],
                        },
                    );
                }
            }
        };
        power(&settings.spec, false);
        power(&settings.cal_pow, false);
        power(&settings.synth, true);

        if let Some(desc) = &settings.crosspow {
            if let Some(reg) = desc.acc_len_reg() {
                regs.insert(reg.to_string(), 1);
            }
            for (row, (re, im)) in config::complex_rows(desc)?.into_iter().enumerate() {
                let lanes = re.len();
                for (imag, names) in [(false, re), (true, im)] {
                    for (lane, name) in names.into_iter().enumerate() {
                        let content = Content::Cross {
                            row,
                            imag,
                            lane,
                            lanes,
                            acc_reg: desc.acc_len_reg().map(str::to_string),
                        };
                        brams.insert(
                            name,
                            Bram {
                                content,
                                dtype: desc.dtype(),
                                data: vec![0; desc.nbytes()],
                            },
                        );
                    }
                }
            }
        }

        let mut const_rows = Vec::new();
        if let (Some(desc), Some(format)) = (&settings.consts, settings.const_format) {
            const_rows = config::complex_rows(desc)?;
            let neutral = receiver.neutral_const();
            for (re, im) in &const_rows {
                for (value, names) in [(neutral.re, re), (neutral.im, im)] {
                    for name in names {
                        brams.insert(
                            name.clone(),
                            Bram {
                                content: Content::Stored,
                                dtype: desc.dtype(),
                                data: encode_fixed(format, desc.dtype(), value, desc.words()),
                            },
                        );
                    }
                }
            }
        }

        let snap_dtype = Dtype {
            kind: Kind::Int,
            size: 1,
            endianness: Endianness::Be,
        };
        let mut snapshots = HashMap::new();
        for (adc, info) in config.snapshots.iter().enumerate() {
            for (lane, name) in info.names.iter().enumerate() {
                snapshots.insert(name.clone(), SnapState::Idle);
                brams.insert(
                    format!("{name}_bram"),
                    Bram {
                        content: Content::Snapshot {
                            snapshot: name.clone(),
                            adc,
                            lane,
                            lanes: info.names.len(),
                        },
                        dtype: snap_dtype,
                        data: vec![0; config.snap_samples],
                    },
                );
            }
        }

        Ok(SimRoach {
            receiver,
            scene,
            bw: config.bw,
            regs,
            brams,
            snapshots,
            snap_samples: config.snap_samples,
            snap_trig_reg: config.snap_trig_reg.clone(),
            delay_regs: config.snapshots.iter().map(|s| s.delay_reg.clone()).collect(),
            adc_delays: config.sim.adc_delays.clone(),
            const_rows,
            const_format: settings.const_format,
            bank: settings.bank.clone(),
            bank_values: HashMap::new(),
            array: config.array_info.clone(),
            clock_mhz: config.sim.clock_mhz,
            start: tokio::time::Instant::now(),
            captures: 0,
            generation: 0,
            cache_key: None,
            acq: Acquisition::default(),
            bitstream: None,
        })
    }

    /// Receiver model.
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Bitstream last programmed.
    pub fn bitstream(&self) -> Option<&str> {
        self.bitstream.as_deref()
    }

    /// Programs a bitstream.
    pub fn program(&mut self, bitstream: &str) {
        tracing::debug!(bitstream, "simulated programming");
        self.bitstream = Some(bitstream.to_string());
    }

    /// Lists the registers and memories of the design.
    pub fn listdev(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .regs
            .keys()
            .chain(self.brams.keys())
            .cloned()
            .collect();
        names.push(CLOCK_COUNTER.to_string());
        for name in self.snapshots.keys() {
            names.push(format!("{name}_status"));
        }
        names.sort();
        names.dedup();
        names
    }

    /// Committed value of a phasor bank location.
    pub fn bank_value(&self, address: &[u32]) -> Option<Complex64> {
        self.bank_values.get(address).copied()
    }

    fn clock_cycles(&self) -> u64 {
        (self.start.elapsed().as_secs_f64() * self.clock_mhz * 1e6) as u64
    }

    fn capture_time(&mut self) -> u64 {
        self.captures += 1;
        self.clock_cycles() + self.captures * CAPTURE_SPACING
    }

    fn snapshot_name<'a>(&self, reg: &'a str, suffix: &str) -> Option<&'a str> {
        reg.strip_suffix(suffix)
            .filter(|base| self.snapshots.contains_key(*base))
    }

    /// Reads a register.
    pub fn read_reg(&mut self, name: &str) -> Result<u32, Error> {
        if name == CLOCK_COUNTER {
            return Ok((self.clock_cycles() % (1 << 32)) as u32);
        }
        if let Some(snapshot) = self.snapshot_name(name, "_status") {
            return Ok(match self.snapshots[snapshot] {
                SnapState::Idle => 0,
                SnapState::Armed => STATUS_BUSY,
                SnapState::Captured(_) => self.snap_samples as u32,
            });
        }
        self.regs
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(name.to_string()))
    }

    /// Writes a register.
    pub fn write_reg(&mut self, name: &str, value: u32) -> Result<(), Error> {
        let old = match self.regs.get_mut(name) {
            Some(reg) => std::mem::replace(reg, value),
            None => return Err(Error::UnknownName(name.to_string())),
        };
        self.generation += 1;
        let rising = old == 0 && value != 0;

        if let Some(snapshot) = self.snapshot_name(name, "_ctrl") {
            let snapshot = snapshot.to_string();
            let state = if value & CTRL_ENABLE == 0 {
                SnapState::Idle
            } else if old & CTRL_ENABLE != 0 {
                self.snapshots[&snapshot]
            } else if value & CTRL_MAN_TRIG != 0 {
                SnapState::Captured(self.capture_time())
            } else {
                SnapState::Armed
            };
            self.snapshots.insert(snapshot, state);
        }

        if rising && self.snap_trig_reg.as_deref() == Some(name) {
            let t = self.capture_time();
            for state in self.snapshots.values_mut() {
                if *state == SnapState::Armed {
                    *state = SnapState::Captured(t);
                }
            }
        }

        if let Some(bank) = &self.bank {
            if rising && bank.we_reg() == name {
                let (re_reg, im_reg) = bank.data_regs();
                let nbits = bank.format().nbits();
                let lsb = bank.format().lsb();
                let reg = |name: &str| self.regs.get(name).copied().unwrap_or(0);
                let re = fpga::from_register(reg(re_reg), nbits) as f64 * lsb;
                let im = fpga::from_register(reg(im_reg), nbits) as f64 * lsb;
                let address: Vec<u32> = bank.addr_regs().iter().map(|r| reg(r)).collect();
                tracing::trace!(?address, re, im, "phasor commit");
                self.bank_values.insert(address, Complex64::new(re, im));
            }
        }
        Ok(())
    }

    fn bram(&self, name: &str, offset: usize, len: usize) -> Result<&Bram, Error> {
        let bram = self
            .brams
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        if offset + len > bram.data.len() {
            return Err(Error::Transport {
                target: name.to_string(),
                reason: format!(
                    "access of {len} bytes at offset {offset} past the end of {} bytes",
                    bram.data.len()
                ),
            });
        }
        Ok(bram)
    }

    /// Reads bytes from a memory.
    pub fn read_bytes(&mut self, name: &str, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let bram = self.bram(name, offset, len)?.clone();
        let words = bram.data.len() / bram.dtype.size;
        let data = match &bram.content {
            Content::Stored => bram.data,
            Content::Power {
                outputs,
                index,
                lane,
                lanes,
                acc_reg,
            } => {
                let acc = self.acc_len(acc_reg.as_deref());
                let acq = self.acquisition();
                let set = if *outputs { &acq.outputs } else { &acq.inputs };
                let values: Vec<f64> = match set.get(*index) {
                    Some(spectrum) => lane_values(spectrum, *lane, *lanes, words),
                    None => vec![0.0; words],
                };
                encode_accumulated(bram.dtype, &values, acc)
            }
            Content::Cross {
                row,
                imag,
                lane,
                lanes,
                acc_reg,
            } => {
                let acc = self.acc_len(acc_reg.as_deref());
                let acq = self.acquisition();
                let values: Vec<f64> = match acq.cross.get(*row) {
                    Some(cross) => {
                        let part: Vec<f64> = cross
                            .iter()
                            .map(|z| if *imag { z.im } else { z.re })
                            .collect();
                        lane_values(&part, *lane, *lanes, words)
                    }
                    None => vec![0.0; words],
                };
                encode_accumulated(bram.dtype, &values, acc)
            }
            Content::Snapshot {
                snapshot,
                adc,
                lane,
                lanes,
            } => match self.snapshots[snapshot] {
                SnapState::Captured(t) => {
                    let tones = self.scene.tones(self.bw);
                    let delays = self.dsp().delays;
                    let series = self
                        .receiver
                        .time_series(&tones, &delays, t, lanes * words);
                    series[*adc]
                        .iter()
                        .skip(*lane)
                        .step_by(*lanes)
                        .map(|x| x.round().clamp(-128.0, 127.0) as i8 as u8)
                        .collect()
                }
                _ => bram.data,
            },
        };
        Ok(data[offset..offset + len].to_vec())
    }

    /// Writes bytes into a memory.
    pub fn write_bytes(&mut self, name: &str, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.bram(name, offset, data.len())?;
        if let Some(bram) = self.brams.get_mut(name) {
            bram.data[offset..offset + data.len()].copy_from_slice(data);
        }
        self.generation += 1;
        Ok(())
    }

    fn acc_len(&self, reg: Option<&str>) -> f64 {
        reg.and_then(|r| self.regs.get(r))
            .map(|&n| f64::from(n.max(1)))
            .unwrap_or(1.0)
    }

    fn stored(&self, names: &[String], format: Format) -> Vec<f64> {
        let lanes: Vec<Vec<f64>> = names
            .iter()
            .map(|name| match self.brams.get(name) {
                Some(bram) => {
                    let scale = match bram.dtype.kind {
                        Kind::Float => 1.0,
                        _ => format.lsb(),
                    };
                    bram.dtype
                        .decode(&bram.data)
                        .into_iter()
                        .map(|x| x * scale)
                        .collect()
                }
                None => Vec::new(),
            })
            .collect();
        memory::interleave(&lanes)
    }

    /// Current state of the programmable DSP blocks.
    pub fn dsp(&self) -> Dsp {
        let consts = match self.const_format {
            Some(format) => self
                .const_rows
                .iter()
                .map(|(re, im)| {
                    self.stored(re, format)
                        .into_iter()
                        .zip(self.stored(im, format))
                        .map(|(a, b)| Complex64::new(a, b))
                        .collect()
                })
                .collect(),
            None => Vec::new(),
        };
        let weights = match (&self.bank, &self.array) {
            (Some(bank), Some(array)) => (0..self.receiver.num_inputs())
                .map(|j| {
                    beam::element_address(array, j, bank.addr_regs().len())
                        .and_then(|address| self.bank_value(&address))
                        .unwrap_or(Complex64::new(1.0, 0.0))
                })
                .collect(),
            _ => Vec::new(),
        };
        let delays = (0..self.receiver.num_inputs())
            .map(|j| {
                let intrinsic = self.adc_delays.get(j).copied().unwrap_or(0);
                let reg = self
                    .delay_regs
                    .get(j)
                    .and_then(Option::as_ref)
                    .and_then(|r| self.regs.get(r))
                    .copied()
                    .unwrap_or(0);
                intrinsic + i64::from(reg)
            })
            .collect();
        Dsp {
            consts,
            weights,
            delays,
        }
    }

    fn acquisition(&mut self) -> &Acquisition {
        let key = (self.scene.generation(), self.generation);
        if self.cache_key != Some(key) {
            let tones = self.scene.tones(self.bw);
            self.acq = self.receiver.acquire(&tones, &self.dsp());
            self.cache_key = Some(key);
        }
        &self.acq
    }
}

fn lane_values(logical: &[f64], lane: usize, lanes: usize, words: usize) -> Vec<f64> {
    (0..words)
        .map(|i| logical.get(i * lanes + lane).copied().unwrap_or(0.0))
        .collect()
}

fn encode_accumulated(dtype: Dtype, values: &[f64], acc: f64) -> Vec<u8> {
    let values: Vec<Value> = values
        .iter()
        .map(|&x| match dtype.kind {
            Kind::Float => Value::Float(x * acc),
            _ => Value::Int((x * acc).round() as i128),
        })
        .collect();
    dtype.encode(&values)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fpga::{Backend, Roach};
    use roachcal_json::{Config, MemoryInfo, PhasorBankInfo, SnapshotInfo};

    fn power_info(names: Vec<&str>, data_type: &str) -> MemoryInfo {
        MemoryInfo {
            addr_width: 5,
            data_width: 64,
            data_type: data_type.to_string(),
            acc_len_reg: Some("acc_len".to_string()),
            interleave: false,
            names: BramNames::List(names.into_iter().map(String::from).collect()),
        }
    }

    fn sideband_config() -> Config {
        let mut config = Config {
            simulated: true,
            bw: 640.0,
            ..Config::default()
        };
        config.cal_pow_info = Some(power_info(vec!["a2", "b2"], ">u8"));
        config.crosspow_info = Some(power_info(vec!["ab_re", "ab_im"], ">i8"));
        config.const_brams_info = Some(MemoryInfo {
            data_width: 32,
            data_type: ">i4".to_string(),
            acc_len_reg: None,
            names: BramNames::List2d(vec![
                vec!["c0_re".into(), "c0_im".into()],
                vec!["c1_re".into(), "c1_im".into()],
            ]),
            ..power_info(vec![], ">i4")
        });
        config
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_names() {
        let settings = Settings::new(sideband_config()).unwrap();
        let mut sim = SimRoach::new(&settings, Scene::new(0)).unwrap();
        assert!(matches!(sim.read_reg("nope"), Err(Error::UnknownName(_))));
        assert!(matches!(sim.write_reg("nope", 1), Err(Error::UnknownName(_))));
        assert!(matches!(
            sim.read_bytes("nope", 0, 4),
            Err(Error::UnknownName(_))
        ));
        assert!(sim.read_bytes("a2", 0, 4096).is_err());
        assert!(sim.listdev().contains(&"c1_im".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn accumulation_scales_powers() {
        let settings = Settings::new(sideband_config()).unwrap();
        let scene = Scene::new(0);
        let rf = SimSource::new(scene.clone(), Role::Rf, 1.0);
        // channel 4 is at 80 MHz
        rf.set_frequency(80.0);
        rf.set_power(-10.0);
        rf.set_output(true);
        let mut roach = Roach::from_backend(Backend::Simulated(SimRoach::new(&settings, scene).unwrap()));
        let a2 = settings.cal_pow.clone().unwrap();
        let one = roach.read_group(&a2).await.unwrap();
        roach.set_reg("acc_len", 4).await.unwrap();
        let four = roach.read_group(&a2).await.unwrap();
        assert!(one[0][4] > 1e6);
        approx::assert_relative_eq!(four[0][4], 4.0 * one[0][4], max_relative = 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn dbfs_follows_accumulation_register() {
        let settings = Settings::new(sideband_config()).unwrap();
        let scene = Scene::new(0);
        let rf = SimSource::new(scene.clone(), Role::Rf, 1.0);
        rf.set_frequency(80.0);
        rf.set_power(-10.0);
        rf.set_output(true);
        let mut roach = Roach::from_backend(Backend::Simulated(SimRoach::new(&settings, scene).unwrap()));
        let a2 = settings.cal_pow.clone().unwrap();
        let one = crate::spectra::read_power_spectrum(&mut roach, &a2).await.unwrap();
        let one = crate::spectra::scale_dbfs(&mut roach, &one, &a2, 128.0).await.unwrap();
        roach.set_reg("acc_len", 4).await.unwrap();
        let raw = crate::spectra::read_power_spectrum(&mut roach, &a2).await.unwrap();
        let four = crate::spectra::scale_dbfs(&mut roach, &raw, &a2, 128.0).await.unwrap();
        for (db, x) in four.iter().zip(raw.iter()) {
            assert!(db.is_finite());
            approx::assert_abs_diff_eq!(*db, 10.0 * (x / 4.0 + 1.0).log10() - 128.0, epsilon = 1e-9);
        }
        approx::assert_abs_diff_eq!(four[4], one[4], epsilon = 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_estimate() {
        let settings = Settings::new(sideband_config()).unwrap();
        let sim = SimRoach::new(&settings, Scene::new(0)).unwrap();
        let mut roach = Roach::from_backend(Backend::Simulated(sim));
        let clock = roach.estimate_clock().await.unwrap();
        approx::assert_relative_eq!(clock, 250.0, max_relative = 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn phasor_bank_commits_on_rising_edge() {
        let mut config = sideband_config();
        config.phasor_bank = Some(PhasorBankInfo {
            re_reg: "ph_re".to_string(),
            im_reg: "ph_im".to_string(),
            addr_regs: vec!["ph_addr".to_string()],
            we_reg: "ph_we".to_string(),
            nbits: 18,
            bin_pt: 17,
        });
        let settings = Settings::new(config).unwrap();
        let bank = settings.bank.clone().unwrap();
        let sim = SimRoach::new(&settings, Scene::new(0)).unwrap();
        let mut roach = Roach::from_backend(Backend::Simulated(sim));
        let old = Complex64::new(0.5, -0.25);
        roach.write_phasor(&bank, old, &[3]).await.unwrap();
        // data and address without a write-enable pulse leave the bank as is
        roach.set_reg("ph_re", 0x1000).await.unwrap();
        roach.set_reg("ph_im", 0x2000).await.unwrap();
        roach.set_reg("ph_addr", 3).await.unwrap();
        roach.set_reg("ph_we", 0).await.unwrap();
        assert_eq!(roach.sim().unwrap().bank_value(&[3]), Some(old));
        let new = Complex64::new(-1.0, 0.0);
        assert_eq!(roach.write_phasor(&bank, new, &[3]).await.unwrap(), 0);
        let value = roach.sim().unwrap().bank_value(&[3]).unwrap();
        // saturated one LSB below the largest value
        assert_eq!(value, Complex64::new(-1.0 + 2f64.powi(-16), 0.0));
        assert_eq!(roach.sim().unwrap().bank_value(&[0]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_snapshots_share_capture_instant() {
        let mut config = sideband_config();
        config.sim.model = SimModel::Adc;
        config.sim.adc_delays = vec![0, 7];
        config.sim.noise_db = f64::NEG_INFINITY;
        config.snap_samples = 256;
        config.snap_trig_reg = Some("snap_trig".to_string());
        config.snapshots = vec![
            SnapshotInfo {
                zdok: 0,
                names: vec!["adc0_snap".to_string()],
                delay_reg: Some("adc0_delay".to_string()),
            },
            SnapshotInfo {
                zdok: 1,
                names: vec!["adc1_snap".to_string()],
                delay_reg: Some("adc1_delay".to_string()),
            },
        ];
        let settings = Settings::new(config).unwrap();
        let sim = SimRoach::new(&settings, Scene::new(0)).unwrap();
        let mut roach = Roach::from_backend(Backend::Simulated(sim));
        let names = vec!["adc0_snap".to_string(), "adc1_snap".to_string()];
        let x = roach
            .snapshot_all_sync(&names, "snap_trig", 256)
            .await
            .unwrap();
        assert_eq!(x[0].len(), 256);
        assert!(x[0].iter().any(|&s| s != 0));
        for n in 7..256 {
            assert_eq!(x[1][n], x[0][n - 7]);
        }
        // independent captures happen at different instants
        let a = roach.snapshot("adc0_snap", 256).await.unwrap();
        let b = roach.snapshot("adc1_snap", 256).await.unwrap();
        assert!((7..256).any(|n| b[n] != a[n - 7]));
        // a snapshot that is never triggered times out
        roach.set_reg("snap_trig", 0).await.unwrap();
        roach.set_reg("adc0_snap_ctrl", 0).await.unwrap();
        roach.set_reg("adc0_snap_ctrl", 1).await.unwrap();
        let err = roach
            .snapshot_all_sync(&names[..1], "adc1_delay", 256)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Timeout(_))));
    }
}
