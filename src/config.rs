//! Configuration.
//!
//! This module loads the JSON configuration file given to every roachcal
//! program and validates it into [`Settings`]. The settings hold the typed
//! handles (memory descriptors, fixed-point formats, phasor bank) that the
//! experiments use. Every problem with the configuration is reported as an
//! [`Error::Config`] before any device is touched.

use crate::{
    error::Error,
    fixed::Format,
    fpga::PhasorBank,
    memory::MemoryDesc,
};
use anyhow::{Context, Result};
use roachcal_json::{BramNames, MemoryInfo, SourceInfo};
use std::path::Path;

pub use roachcal_json::Config;

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Configuration as given in the file.
    pub config: Config,
    /// Spectrometer power memories.
    pub spec: Option<MemoryDesc>,
    /// Synthesized output power memories.
    pub synth: Option<MemoryDesc>,
    /// Cross-power memories.
    pub crosspow: Option<MemoryDesc>,
    /// Input power memories.
    pub cal_pow: Option<MemoryDesc>,
    /// Coefficient memories.
    pub consts: Option<MemoryDesc>,
    /// Coefficient format.
    pub const_format: Option<Format>,
    /// Beamformer phasor bank.
    pub bank: Option<PhasorBank>,
    nchannels: usize,
}

fn desc(key: &str, info: &Option<MemoryInfo>) -> Result<Option<MemoryDesc>, Error> {
    info.as_ref()
        .map(|info| MemoryDesc::from_info(key, info))
        .transpose()
}

/// Returns the memory names of the `[re, im]` rows of a cross-power or
/// coefficient descriptor.
///
/// Without interleaving each row is `[re, im]`. With interleaving each row is
/// `[re lanes..., im lanes...]`. A `bram_list` of two memories is a single
/// row.
pub fn complex_rows(desc: &MemoryDesc) -> Result<Vec<(Vec<String>, Vec<String>)>, Error> {
    let rows: Vec<Vec<String>> = match desc.names() {
        BramNames::List2d(rows) => rows.clone(),
        BramNames::List(list) => vec![list.clone()],
        BramNames::Name(_) => {
            return Err(Error::Config(format!(
                "{}: complex memories need a [re, im] list",
                desc.key()
            )))
        }
    };
    rows.into_iter()
        .map(|row| {
            if row.len() % 2 != 0 || (!desc.interleave() && row.len() != 2) {
                return Err(Error::Config(format!(
                    "{}: invalid [re, im] row {row:?}",
                    desc.key()
                )));
            }
            let im = row[row.len() / 2..].to_vec();
            let mut re = row;
            re.truncate(im.len());
            Ok((re, im))
        })
        .collect()
}

/// Returns the number of channels of the logical arrays of a complex
/// descriptor.
pub fn complex_len(desc: &MemoryDesc) -> Result<usize, Error> {
    let rows = complex_rows(desc)?;
    let (re, _) = rows
        .first()
        .ok_or_else(|| Error::Config(format!("{}: no [re, im] rows", desc.key())))?;
    Ok(re.len() * desc.words())
}

impl Settings {
    /// Validates a configuration.
    pub fn new(config: Config) -> Result<Settings, Error> {
        let config_err = |msg: String| Error::Config(msg);
        if !(config.bw > 0.0) {
            return Err(config_err("bw must be positive".to_string()));
        }
        if !config.simulated && config.roach_ip.is_none() {
            return Err(config_err("missing key roach_ip".to_string()));
        }
        if (config.upload || config.program) && config.boffile.is_none() {
            return Err(config_err("missing key boffile".to_string()));
        }
        if config.cal_chnl_step == 0 || config.syn_chnl_step == 0 {
            return Err(config_err("channel steps must be positive".to_string()));
        }
        if config.pause_time < 0.0 {
            return Err(config_err("pause_time must not be negative".to_string()));
        }
        let sources = config
            .rf_source
            .iter()
            .chain(config.lo_sources.iter())
            .chain(config.test_source.iter());
        for source in sources {
            if !(source.freq_mult > 0.0) {
                return Err(config_err(format!(
                    "{}: freq_mult must be positive",
                    source.connection
                )));
            }
        }

        let spec = desc("spec_info", &config.spec_info)?;
        let synth = desc("synth_info", &config.synth_info)?;
        let crosspow = desc("crosspow_info", &config.crosspow_info)?;
        let cal_pow = desc("cal_pow_info", &config.cal_pow_info)?;
        let consts = desc("const_brams_info", &config.const_brams_info)?;

        let mut lengths = Vec::new();
        for d in [&spec, &synth, &cal_pow].into_iter().flatten() {
            lengths.push((d.key().to_string(), d.logical_len()));
        }
        for d in [&crosspow, &consts].into_iter().flatten() {
            lengths.push((d.key().to_string(), complex_len(d)?));
        }
        let nchannels = lengths.first().map(|(_, n)| *n).unwrap_or(0);
        if let Some((key, n)) = lengths.iter().find(|(_, n)| *n != nchannels) {
            return Err(config_err(format!(
                "{key} has {n} channels, expected {nchannels}"
            )));
        }

        let const_format = match &consts {
            Some(d) => Some(
                Format::new(
                    config.const_nbits.unwrap_or(d.data_width()),
                    config.const_bin_pt,
                )
                .map_err(|e| config_err(format!("const_brams_info: {e}")))?,
            ),
            None => None,
        };
        let bank = config
            .phasor_bank
            .as_ref()
            .map(PhasorBank::from_info)
            .transpose()?;

        if let Some(array) = &config.array_info {
            if array.el_pos.iter().all(Vec::is_empty) {
                return Err(config_err("array_info: empty el_pos".to_string()));
            }
            if !(array.speed > 0.0 && array.freq > 0.0) {
                return Err(config_err(
                    "array_info: speed and freq must be positive".to_string(),
                ));
            }
            for range in [&array.az_ang_range, &array.el_ang_range] {
                if !(range[2] > 0.0) {
                    return Err(config_err(
                        "array_info: angle steps must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(Settings {
            config,
            spec,
            synth,
            crosspow,
            cal_pow,
            consts,
            const_format,
            bank,
            nchannels,
        })
    }

    /// Returns a required setting.
    pub fn require<'a, T>(value: &'a Option<T>, key: &str) -> Result<&'a T, Error> {
        value
            .as_ref()
            .ok_or_else(|| Error::Config(format!("missing key {key}")))
    }

    /// Number of spectral channels.
    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    /// Settle time after changing a source.
    pub fn pause_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.config.pause_time)
    }

    /// LO frequency lists, one per LO source.
    ///
    /// A source without `lo_freqs` contributes its default frequency.
    pub fn lo_lists(&self) -> Vec<Vec<f64>> {
        self.config
            .lo_sources
            .iter()
            .map(|lo: &SourceInfo| {
                if lo.lo_freqs.is_empty() {
                    vec![lo.def_freq]
                } else {
                    lo.lo_freqs.clone()
                }
            })
            .collect()
    }

    /// Cartesian product of the LO frequency lists.
    ///
    /// The first LO varies slowest. Without LO sources there is a single empty
    /// combination.
    pub fn lo_combinations(&self) -> Vec<Vec<f64>> {
        self.lo_lists()
            .iter()
            .fold(vec![Vec::new()], |combinations, list| {
                combinations
                    .iter()
                    .flat_map(|prefix| {
                        list.iter().map(move |&f| {
                            let mut c = prefix.clone();
                            c.push(f);
                            c
                        })
                    })
                    .collect()
            })
    }

    /// Registers named by the configuration.
    pub fn register_names(&self) -> Vec<String> {
        let config = &self.config;
        let mut names: Vec<String> = config.set_regs.iter().map(|r| r.name.clone()).collect();
        names.extend(config.reset_regs.iter().cloned());
        for d in self.descs() {
            if let Some(reg) = d.acc_len_reg() {
                names.push(reg.to_string());
            }
        }
        names.extend(config.snap_trig_reg.iter().cloned());
        for snapshot in &config.snapshots {
            names.extend(snapshot.delay_reg.iter().cloned());
            for name in &snapshot.names {
                names.push(format!("{name}_ctrl"));
                names.push(format!("{name}_status"));
            }
        }
        if let Some(bank) = &self.bank {
            names.extend(bank.register_names().into_iter().map(str::to_string));
        }
        names.sort();
        names.dedup();
        names
    }

    /// Memories named by the configuration.
    pub fn memory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .descs()
            .flat_map(|d| d.all_names().into_iter().map(str::to_string))
            .collect();
        for snapshot in &self.config.snapshots {
            names.extend(snapshot.names.iter().map(|name| format!("{name}_bram")));
        }
        names.sort();
        names.dedup();
        names
    }

    fn descs(&self) -> impl Iterator<Item = &MemoryDesc> {
        [
            &self.spec,
            &self.synth,
            &self.crosspow,
            &self.cal_pow,
            &self.consts,
        ]
        .into_iter()
        .flatten()
    }
}

/// Loads and validates a configuration file.
#[tracing::instrument(level = "debug")]
pub async fn load(path: &Path) -> Result<Settings> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(Settings::new(config)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use roachcal_json::{RegisterValue, SourceKind};

    fn source(lo_freqs: Vec<f64>) -> SourceInfo {
        SourceInfo {
            kind: SourceKind::Sim,
            connection: "sim".to_string(),
            def_freq: 1000.0,
            def_power: -10.0,
            freq_mult: 1.0,
            lo_freqs,
            settle_time: None,
        }
    }

    fn power_info(names: Vec<&str>) -> MemoryInfo {
        MemoryInfo {
            addr_width: 6,
            data_width: 64,
            data_type: ">u8".to_string(),
            acc_len_reg: Some("acc_len".to_string()),
            interleave: false,
            names: BramNames::List(names.into_iter().map(String::from).collect()),
        }
    }

    fn base() -> Config {
        Config {
            simulated: true,
            bw: 1080.0,
            ..Config::default()
        }
    }

    #[test]
    fn lo_product() {
        let mut config = base();
        config.lo_sources = vec![source(vec![1.0, 2.0, 3.0]), source(vec![10.0, 20.0])];
        let settings = Settings::new(config).unwrap();
        let c = settings.lo_combinations();
        assert_eq!(c.len(), 6);
        assert_eq!(c[0], vec![1.0, 10.0]);
        assert_eq!(c[1], vec![1.0, 20.0]);
        assert_eq!(c[5], vec![3.0, 20.0]);
        let settings = Settings::new(base()).unwrap();
        assert_eq!(settings.lo_combinations(), vec![Vec::<f64>::new()]);
    }

    #[test]
    fn missing_keys() {
        let mut config = base();
        config.simulated = false;
        assert!(matches!(Settings::new(config), Err(Error::Config(_))));
        let mut config = base();
        config.bw = 0.0;
        assert!(Settings::new(config).is_err());
        let settings = Settings::new(base()).unwrap();
        let err = Settings::require(&settings.cal_pow, "cal_pow_info").unwrap_err();
        assert_eq!(err.to_string(), "configuration error: missing key cal_pow_info");
    }

    #[test]
    fn channel_counts_must_agree() {
        let mut config = base();
        config.cal_pow_info = Some(power_info(vec!["a2", "b2"]));
        let mut cross = power_info(vec![]);
        cross.data_type = ">i8".to_string();
        cross.names = BramNames::List2d(vec![vec!["ab_re".into(), "ab_im".into()]]);
        config.crosspow_info = Some(cross.clone());
        let settings = Settings::new(config.clone()).unwrap();
        assert_eq!(settings.nchannels(), 64);

        cross.addr_width = 5;
        config.crosspow_info = Some(cross);
        assert!(Settings::new(config).is_err());
    }

    #[test]
    fn names() {
        let mut config = base();
        config.set_regs = vec![RegisterValue {
            name: "cnt_rst".to_string(),
            val: 0,
        }];
        config.reset_regs = vec!["cnt_rst".to_string()];
        config.cal_pow_info = Some(power_info(vec!["a2", "b2"]));
        let settings = Settings::new(config).unwrap();
        assert_eq!(settings.register_names(), vec!["acc_len", "cnt_rst"]);
        assert_eq!(settings.memory_names(), vec!["a2", "b2"]);
    }

    #[test]
    fn complex_row_split() {
        let mut info = power_info(vec![]);
        info.interleave = true;
        info.names = BramNames::List2d(vec![vec![
            "re0".into(),
            "re1".into(),
            "im0".into(),
            "im1".into(),
        ]]);
        let desc = MemoryDesc::from_info("crosspow_info", &info).unwrap();
        let rows = complex_rows(&desc).unwrap();
        assert_eq!(rows[0].0, vec!["re0", "re1"]);
        assert_eq!(rows[0].1, vec!["im0", "im1"]);
        assert_eq!(complex_len(&desc).unwrap(), 128);
    }
}
