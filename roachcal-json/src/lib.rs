//! roachcal-json contains the JSON schemas used by roachcal: the experiment
//! configuration file given to every calibration program, and the
//! `testinfo.json` manifest stored at the root of every result bundle.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// Experiment configuration JSON schema.
///
/// This JSON schema corresponds to the configuration file passed as the only
/// argument of every roachcal program. Each experiment uses a subset of the
/// keys. Missing keys take the values given by [`Config::default`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Use the simulated ROACH and simulated instruments.
    pub simulated: bool,
    /// IP address or hostname of the ROACH.
    pub roach_ip: Option<String>,
    /// KATCP port of the ROACH.
    pub roach_port: u16,
    /// Upload the bitstream to the ROACH RAM and program it.
    pub upload: bool,
    /// Program a bitstream already stored on the ROACH.
    pub program: bool,
    /// Bitstream file.
    pub boffile: Option<String>,
    /// Registers written at startup.
    pub set_regs: Vec<RegisterValue>,
    /// Registers pulsed `1 -> 0` at startup.
    pub reset_regs: Vec<String>,
    /// Bandwidth in MHz.
    pub bw: f64,
    /// Spectrometer power memories.
    pub spec_info: Option<MemoryInfo>,
    /// Synthesized output power memories.
    pub synth_info: Option<MemoryInfo>,
    /// Cross-power memories, one `[re, im]` row per cross product.
    pub crosspow_info: Option<MemoryInfo>,
    /// Power memories of the calibrated inputs.
    pub cal_pow_info: Option<MemoryInfo>,
    /// dBFS zero reference.
    #[serde(rename = "dBFS_const")]
    pub dbfs_const: f64,
    /// ADC snapshot blocks, one entry per ADC.
    pub snapshots: Vec<SnapshotInfo>,
    /// Number of samples used from each snapshot.
    pub snap_samples: usize,
    /// Register that triggers synchronized snapshots.
    pub snap_trig_reg: Option<String>,
    /// ZDOK numbers of the ADCs to synchronize. The first one is the reference.
    pub cal_adcs: Vec<u32>,
    /// RF tone source.
    pub rf_source: Option<SourceInfo>,
    /// LO sources.
    pub lo_sources: Vec<SourceInfo>,
    /// Auxiliary source (noise source or second tone port).
    pub test_source: Option<SourceInfo>,
    /// Sideband calibration method.
    pub cal_method: CalMethod,
    /// Weight of the USB ratio in the optimal method.
    pub optimal_weight: f64,
    /// First calibration channel.
    pub cal_chnl_start: usize,
    /// Calibration channel stop (exclusive). Defaults to the channel count.
    pub cal_chnl_stop: Option<usize>,
    /// Calibration channel step.
    pub cal_chnl_step: usize,
    /// Verification channel step.
    pub syn_chnl_step: usize,
    /// Apply the Kerr correction to the measured SRR.
    pub kerr_correction: bool,
    /// DSB gain ratio from a hot/cold load test, used by the Kerr correction.
    pub m_dsb: Option<f64>,
    /// Ideal constants loaded before calibrating.
    pub ideal_consts: IdealConsts,
    /// Coefficient memories, one `[re, im]` row per coefficient set.
    pub const_brams_info: Option<MemoryInfo>,
    /// Coefficient bit width. Defaults to the coefficient memory word width.
    pub const_nbits: Option<u32>,
    /// Coefficient binary point.
    pub const_bin_pt: u32,
    /// Settle time after changing a source, in seconds.
    pub pause_time: f64,
    /// Beamformer phasor bank.
    pub phasor_bank: Option<PhasorBankInfo>,
    /// Antenna array description.
    pub array_info: Option<ArrayInfo>,
    /// Consecutive zero-delay iterations required by the ADC synchronizer.
    pub sync_zero_iterations: usize,
    /// Maximum number of ADC synchronizer iterations.
    pub sync_max_iterations: usize,
    /// Channel monitored by the stability test.
    pub stability_chnl: Option<usize>,
    /// Number of readings taken by the stability test.
    pub stability_iters: usize,
    /// Directory where result bundles are written.
    pub datadir: String,
    /// Write SVG plots into the result bundle.
    pub plots: bool,
    /// Simulator settings.
    pub sim: SimInfo,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            simulated: false,
            roach_ip: None,
            roach_port: 7147,
            upload: false,
            program: false,
            boffile: None,
            set_regs: Vec::new(),
            reset_regs: Vec::new(),
            bw: 0.0,
            spec_info: None,
            synth_info: None,
            crosspow_info: None,
            cal_pow_info: None,
            dbfs_const: 0.0,
            snapshots: Vec::new(),
            snap_samples: 2048,
            snap_trig_reg: None,
            cal_adcs: Vec::new(),
            rf_source: None,
            lo_sources: Vec::new(),
            test_source: None,
            cal_method: CalMethod::Lsb,
            optimal_weight: 0.5,
            cal_chnl_start: 1,
            cal_chnl_stop: None,
            cal_chnl_step: 1,
            syn_chnl_step: 1,
            kerr_correction: false,
            m_dsb: None,
            ideal_consts: IdealConsts::default(),
            const_brams_info: None,
            const_nbits: None,
            const_bin_pt: 17,
            pause_time: 0.5,
            phasor_bank: None,
            array_info: None,
            sync_zero_iterations: 5,
            sync_max_iterations: 30,
            stability_chnl: None,
            stability_iters: 100,
            datadir: ".".to_string(),
            plots: true,
            sim: SimInfo::default(),
        }
    }
}

/// Register value JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    /// Register name.
    pub name: String,
    /// Value.
    pub val: u32,
}

/// Memory descriptor JSON schema.
///
/// The word format is given by `data_width` (bits) and `data_type`, a numpy
/// style dtype string such as `">i8"` (big-endian 64-bit signed) or `">u4"`.
/// The dtype carries the signedness and the endianness.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryInfo {
    /// Address width. Each memory holds `2^addr_width` words.
    pub addr_width: u32,
    /// Word width in bits.
    pub data_width: u32,
    /// Element dtype.
    pub data_type: String,
    /// Accumulation length register.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc_len_reg: Option<String>,
    /// The memories of a list (or of each row of a 2-D list) are parallel FFT
    /// lanes to be interleaved.
    #[serde(default)]
    pub interleave: bool,
    /// Memory names.
    #[serde(flatten)]
    pub names: BramNames,
}

/// Memory names of a descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BramNames {
    /// A single memory.
    #[serde(rename = "bram_name")]
    Name(String),
    /// A list of memories.
    #[serde(rename = "bram_list")]
    List(Vec<String>),
    /// A 2-D list of memories.
    #[serde(rename = "bram_list2d")]
    List2d(Vec<Vec<String>>),
}

/// Snapshot block JSON schema.
///
/// The snapshots listed in `names` belong to the same ADC and are
/// interleaved to form its time series.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// ZDOK connector of the ADC.
    pub zdok: u32,
    /// Snapshot block names.
    pub names: Vec<String>,
    /// Delay register of the ADC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_reg: Option<String>,
}

/// Signal source JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Driver type.
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Connection string (`host:port`, `TCPIP::host::port::SOCKET` or
    /// `TCPIP::host::INSTR`).
    pub connection: String,
    /// Default frequency in MHz.
    pub def_freq: f64,
    /// Default power in dBm.
    pub def_power: f64,
    /// Frequency multiplier between the source and the receiver input.
    #[serde(default = "default_freq_mult")]
    pub freq_mult: f64,
    /// LO frequencies to sweep, in MHz.
    #[serde(default)]
    pub lo_freqs: Vec<f64>,
    /// Settle time after each command, in seconds. Defaults to the driver
    /// settle time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_time: Option<f64>,
}

fn default_freq_mult() -> f64 {
    1.0
}

/// Signal source driver type.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generic SCPI generator.
    #[serde(alias = "generic")]
    Scpi,
    /// Anritsu generator.
    Anritsu,
    /// Simulated source.
    Sim,
}

/// Sideband calibration method.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum CalMethod {
    /// Each output is corrected with the ratio measured with a tone in the
    /// opposite sideband.
    #[default]
    #[serde(rename = "LSB", alias = "lsb")]
    Lsb,
    /// Per channel, the ratio with the larger magnitude.
    #[serde(rename = "higher", alias = "Higher")]
    Higher,
    /// Weighted combination of both ratios.
    #[serde(rename = "optimal", alias = "Optimal")]
    Optimal,
}

/// Ideal constants JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IdealConsts {
    /// Load the ideal constants.
    pub load: bool,
    /// Ideal constant as `[re, im]`.
    pub val: [f64; 2],
}

impl Default for IdealConsts {
    fn default() -> IdealConsts {
        IdealConsts {
            load: false,
            val: [1.0, 0.0],
        }
    }
}

/// Phasor bank JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PhasorBankInfo {
    /// Real part data register.
    pub re_reg: String,
    /// Imaginary part data register.
    pub im_reg: String,
    /// Address registers, outermost dimension first.
    pub addr_regs: Vec<String>,
    /// Write-enable register.
    pub we_reg: String,
    /// Phasor bit width.
    pub nbits: u32,
    /// Phasor binary point.
    pub bin_pt: u32,
}

/// Antenna array JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    /// Propagation speed in m/s.
    pub speed: f64,
    /// Frequency in MHz.
    pub freq: f64,
    /// Element separation in metres.
    pub el_sep: f64,
    /// Element positions in units of `el_sep`, one row per array row.
    pub el_pos: Vec<Vec<[f64; 3]>>,
    /// Channel used for calibration and scans.
    pub freq_chnl: usize,
    /// Azimuth scan `[start, stop, step]` in degrees (stop inclusive).
    pub az_ang_range: [f64; 3],
    /// Elevation scan `[start, stop, step]` in degrees (stop inclusive).
    pub el_ang_range: [f64; 3],
    /// Load unit phasors before calibrating.
    #[serde(default)]
    pub ideal_phase_consts: bool,
    /// Reference port for the calibration.
    #[serde(default)]
    pub ref_port: usize,
}

/// Simulator JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SimInfo {
    /// Receiver model.
    pub model: SimModel,
    /// Leakage into the opposite sideband in dB (sideband model).
    pub leakage_db: f64,
    /// Phase of the sideband leakage in degrees.
    pub leakage_deg: f64,
    /// Amplitude imbalance between the two inputs in dB (balanced model).
    pub imbalance_db: f64,
    /// Phase imbalance between the two inputs in degrees (balanced model).
    pub imbalance_deg: f64,
    /// Intrinsic delay of each ADC in samples (ADC model).
    pub adc_delays: Vec<i64>,
    /// Gain of each beamformer port in dB.
    pub port_gains_db: Vec<f64>,
    /// Phase of each beamformer port in degrees.
    pub port_phases_deg: Vec<f64>,
    /// Azimuth of the plane-wave source in degrees.
    pub source_az: f64,
    /// Elevation of the plane-wave source in degrees.
    pub source_el: f64,
    /// Power of the noise common to all inputs in dB.
    pub common_noise_db: Option<f64>,
    /// Power of the independent noise of each input in dB.
    pub noise_db: f64,
    /// FFT frames accumulated per read.
    pub frames: usize,
    /// Random seed.
    pub seed: u64,
    /// FPGA clock in MHz.
    pub clock_mhz: f64,
}

impl Default for SimInfo {
    fn default() -> SimInfo {
        SimInfo {
            model: SimModel::Sideband,
            leakage_db: -20.0,
            leakage_deg: 30.0,
            imbalance_db: 0.5,
            imbalance_deg: 5.0,
            adc_delays: Vec::new(),
            port_gains_db: Vec::new(),
            port_phases_deg: Vec::new(),
            source_az: 0.0,
            source_el: 0.0,
            common_noise_db: None,
            noise_db: -60.0,
            frames: 4,
            seed: 1,
            clock_mhz: 250.0,
        }
    }
}

/// Simulated receiver model.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimModel {
    /// Sideband-separating receiver.
    #[default]
    Sideband,
    /// Balanced mixer.
    Balanced,
    /// Set of ADCs sampling a common signal.
    Adc,
    /// Antenna array and beamformer.
    Beamformer,
}

/// Test information JSON schema.
///
/// This JSON schema corresponds to the `testinfo.json` manifest stored at the
/// root of a result bundle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestInfo {
    /// Experiment name.
    pub experiment: String,
    /// Software version.
    pub version: String,
    /// Start date and time.
    pub date: String,
    /// Completion status.
    pub status: Status,
    /// Error that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The run used the simulator.
    pub simulated: bool,
    /// Bandwidth in MHz.
    pub bw: f64,
    /// Number of channels.
    pub nchannels: usize,
    /// Accumulation length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc_len: Option<u32>,
    /// LO frequency combinations in MHz.
    pub lo_combinations: Vec<Vec<f64>>,
    /// Calibration channel step.
    pub cal_chnl_step: usize,
    /// Verification channel step.
    pub syn_chnl_step: usize,
    /// Sideband calibration method.
    pub cal_method: CalMethod,
    /// Kerr correction applied.
    pub kerr_correction: bool,
    /// Ideal constants.
    pub ideal_consts: IdealConsts,
    /// Coefficient binary point.
    pub const_bin_pt: u32,
    /// Fixed-point values that had to be saturated.
    pub overflow_warnings: usize,
    /// Memory writes whose dtype did not match the memory.
    pub type_mismatch_warnings: usize,
}

/// Completion status of a run.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The run finished.
    Complete,
    /// The run was aborted or cancelled.
    Incomplete,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_info_names() {
        let info: MemoryInfo = serde_json::from_str(
            r#"{"addr_width": 9, "data_width": 64, "data_type": ">u8",
                "acc_len_reg": "acc_len", "bram_list": ["dout0", "dout1"]}"#,
        )
        .unwrap();
        assert_eq!(
            info.names,
            BramNames::List(vec!["dout0".to_string(), "dout1".to_string()])
        );
        assert!(!info.interleave);
        let info: MemoryInfo = serde_json::from_str(
            r#"{"addr_width": 9, "data_width": 64, "data_type": ">i8",
                "interleave": true, "bram_list2d": [["re0", "re1"], ["im0", "im1"]]}"#,
        )
        .unwrap();
        assert!(matches!(info.names, BramNames::List2d(ref rows) if rows.len() == 2));
        assert_eq!(info.acc_len_reg, None);
    }

    #[test]
    fn config_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"simulated": true, "bw": 1080, "dBFS_const": 128.0, "cal_method": "higher"}"#,
        )
        .unwrap();
        assert!(config.simulated);
        assert_eq!(config.roach_port, 7147);
        assert_eq!(config.dbfs_const, 128.0);
        assert_eq!(config.cal_method, CalMethod::Higher);
        assert_eq!(config.sync_zero_iterations, 5);
        assert_eq!(config.sim.model, SimModel::Sideband);
    }

    #[test]
    fn source_info() {
        let source: SourceInfo = serde_json::from_str(
            r#"{"type": "generic", "connection": "192.168.1.34:5025",
                "def_freq": 10000, "def_power": -10, "lo_freqs": [9000, 9500]}"#,
        )
        .unwrap();
        assert_eq!(source.kind, SourceKind::Scpi);
        assert_eq!(source.freq_mult, 1.0);
        assert_eq!(source.lo_freqs, vec![9000.0, 9500.0]);
    }

    #[test]
    fn status_json() {
        assert_eq!(
            serde_json::to_string(&Status::Incomplete).unwrap(),
            r#""incomplete""#
        );
    }
}
