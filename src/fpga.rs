//! ROACH FPGA façade.
//!
//! This module contains [`Roach`], which gives access to the registers,
//! memories, snapshot blocks and phasor banks of the design running on a
//! ROACH. The transport is either KATCP over TCP or the in-memory simulator
//! from [`crate::sim`]. Both backends only provide raw register and memory
//! access. The snapshot, memory group and phasor bank protocols are
//! implemented here on top of them.

use crate::{
    config::{self, Settings},
    error::Error,
    fixed::{self, Format},
    katcp::KatcpClient,
    memory::{self, Kind, MemoryDesc, Word},
    sim::{Scene, SimRoach},
};
use anyhow::{Context, Result};
use num_complex::Complex64;
use roachcal_json::{BramNames, PhasorBankInfo, RegisterValue};
use std::{path::Path, time::Duration};

const RESET_SETTLE: Duration = Duration::from_millis(10);
const PHASOR_SETTLE: Duration = Duration::from_millis(1);
const SNAPSHOT_POLL: Duration = Duration::from_millis(10);
const SNAPSHOT_MAX_POLLS: usize = 100;
const CLOCK_ESTIMATE_TIME: Duration = Duration::from_secs(2);

/// Register counting FPGA clock cycles.
pub const CLOCK_COUNTER: &str = "sys_clkcounter";

// snapshot control and status bits
pub(crate) const CTRL_ENABLE: u32 = 1 << 0;
pub(crate) const CTRL_MAN_TRIG: u32 = 1 << 1;
pub(crate) const STATUS_BUSY: u32 = 1 << 31;

/// FPGA transport backend.
#[derive(Debug)]
pub enum Backend {
    /// KATCP over TCP.
    Katcp(KatcpClient),
    /// In-memory simulator.
    Simulated(SimRoach),
}

/// ROACH FPGA.
///
/// This struct represents the design running on a ROACH and gives access to
/// its registers and memories. It is the only writer of the FPGA during an
/// experiment.
#[derive(Debug)]
pub struct Roach {
    backend: Backend,
    type_mismatches: usize,
}

/// Phasor bank.
///
/// A phasor bank is a set of coefficient locations addressed by one or more
/// address registers. A rising edge on the write-enable register commits the
/// value held by the two data registers to the location selected by the
/// address registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasorBank {
    re_reg: String,
    im_reg: String,
    addr_regs: Vec<String>,
    we_reg: String,
    format: Format,
}

impl PhasorBank {
    /// Validates a phasor bank description.
    pub fn from_info(info: &PhasorBankInfo) -> Result<PhasorBank, Error> {
        if info.addr_regs.is_empty() {
            return Err(Error::Config(
                "phasor_bank: at least one address register is needed".to_string(),
            ));
        }
        if info.nbits > 32 {
            return Err(Error::Config(format!(
                "phasor_bank: {} bits do not fit in a register",
                info.nbits
            )));
        }
        let format = Format::new(info.nbits, info.bin_pt)
            .map_err(|e| Error::Config(format!("phasor_bank: {e}")))?;
        Ok(PhasorBank {
            re_reg: info.re_reg.clone(),
            im_reg: info.im_reg.clone(),
            addr_regs: info.addr_regs.clone(),
            we_reg: info.we_reg.clone(),
            format,
        })
    }

    /// Phasor fixed-point format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Real and imaginary part data registers.
    pub fn data_regs(&self) -> (&str, &str) {
        (&self.re_reg, &self.im_reg)
    }

    /// Address registers.
    pub fn addr_regs(&self) -> &[String] {
        &self.addr_regs
    }

    /// Write-enable register.
    pub fn we_reg(&self) -> &str {
        &self.we_reg
    }

    /// All the registers of the bank.
    pub fn register_names(&self) -> Vec<&str> {
        let mut names = vec![self.re_reg.as_str(), self.im_reg.as_str(), &self.we_reg];
        names.extend(self.addr_regs.iter().map(String::as_str));
        names
    }
}

/// Encodes a fixed-point integer as a register value of `nbits` bits.
pub fn to_register(value: i64, nbits: u32) -> u32 {
    let mask = if nbits >= 32 {
        u32::MAX
    } else {
        (1u32 << nbits) - 1
    };
    (value as u32) & mask
}

/// Decodes a register value holding a fixed-point integer of `nbits` bits.
pub fn from_register(value: u32, nbits: u32) -> i64 {
    let shift = 64 - nbits;
    ((value as u64) << shift) as i64 >> shift
}

impl Roach {
    /// Connects to the ROACH given by the configuration.
    ///
    /// If the configuration selects the simulator, the simulated ROACH is
    /// attached to `scene`, which it shares with the simulated instruments.
    #[tracing::instrument(name = "Roach::connect", level = "debug", skip_all)]
    pub async fn connect(settings: &Settings, scene: &Scene) -> Result<Roach> {
        let config = &settings.config;
        let backend = if config.simulated {
            tracing::info!("using simulated ROACH");
            Backend::Simulated(SimRoach::new(settings, scene.clone())?)
        } else {
            let ip = Settings::require(&config.roach_ip, "roach_ip")?;
            Backend::Katcp(KatcpClient::connect(ip, config.roach_port).await?)
        };
        Ok(Roach::from_backend(backend))
    }

    /// Creates a ROACH façade over a backend.
    pub fn from_backend(backend: Backend) -> Roach {
        Roach {
            backend,
            type_mismatches: 0,
        }
    }

    /// Programs the ROACH as the configuration requests, validates the names
    /// used by the configuration, and applies the startup register values.
    #[tracing::instrument(name = "Roach::initialize", level = "debug", skip_all)]
    pub async fn initialize(&mut self, settings: &Settings) -> Result<()> {
        let config = &settings.config;
        if config.upload {
            let boffile = Settings::require(&config.boffile, "boffile")?;
            self.upload_program(Path::new(boffile)).await?;
        } else if config.program {
            let boffile = Settings::require(&config.boffile, "boffile")?;
            self.program(boffile).await?;
        }
        self.validate_names(&settings.register_names(), &settings.memory_names())
            .await?;
        self.apply_startup(&config.set_regs, &config.reset_regs)
            .await
    }

    /// Returns `true` if the transport is connected.
    pub fn is_connected(&self) -> bool {
        match &self.backend {
            Backend::Katcp(client) => client.is_connected(),
            Backend::Simulated(_) => true,
        }
    }

    /// Gives access to the simulator, if this is a simulated ROACH.
    pub fn sim(&self) -> Option<&SimRoach> {
        match &self.backend {
            Backend::Simulated(sim) => Some(sim),
            Backend::Katcp(_) => None,
        }
    }

    /// Number of memory writes whose element type did not match the memory
    /// dtype.
    pub fn type_mismatches(&self) -> usize {
        self.type_mismatches
    }

    /// Uploads a bitstream to the ROACH RAM and programs it.
    pub async fn upload_program(&mut self, path: &Path) -> Result<()> {
        let bitstream = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        tracing::info!(path = %path.display(), size = bitstream.len(), "uploading bitstream");
        match &mut self.backend {
            Backend::Katcp(client) => client.progremote(&bitstream).await?,
            Backend::Simulated(sim) => sim.program(&path.display().to_string()),
        }
        Ok(())
    }

    /// Programs a bitstream stored on the ROACH.
    pub async fn program(&mut self, boffile: &str) -> Result<()> {
        tracing::info!(boffile, "programming bitstream");
        match &mut self.backend {
            Backend::Katcp(client) => client.progdev(boffile).await?,
            Backend::Simulated(sim) => sim.program(boffile),
        }
        Ok(())
    }

    /// Checks that all the registers and memories exist in the running
    /// design.
    pub async fn validate_names(&mut self, registers: &[String], memories: &[String]) -> Result<()> {
        let devices = match &mut self.backend {
            Backend::Katcp(client) => client.listdev().await?,
            Backend::Simulated(sim) => sim.listdev(),
        };
        if let Some(name) = registers
            .iter()
            .chain(memories.iter())
            .find(|name| !devices.contains(name))
        {
            return Err(Error::UnknownName(name.clone()).into());
        }
        Ok(())
    }

    /// Estimates the FPGA clock frequency in MHz.
    ///
    /// The clock counter is read twice, two seconds apart.
    pub async fn estimate_clock(&mut self) -> Result<f64> {
        let first = self.read_reg(CLOCK_COUNTER).await?;
        let start = tokio::time::Instant::now();
        tokio::time::sleep(CLOCK_ESTIMATE_TIME).await;
        let second = self.read_reg(CLOCK_COUNTER).await?;
        let elapsed = start.elapsed().as_secs_f64();
        // the counter wraps at 2^32
        let cycles = second.wrapping_sub(first);
        Ok(f64::from(cycles) / elapsed / 1e6)
    }

    /// Writes a register.
    pub async fn set_reg(&mut self, name: &str, value: u32) -> Result<()> {
        tracing::trace!(name, value, "set register");
        match &mut self.backend {
            Backend::Katcp(client) => client.wordwrite(name, value).await,
            Backend::Simulated(sim) => sim.write_reg(name, value),
        }
        .with_context(|| format!("failed to write register {name}"))
    }

    /// Reads a register.
    pub async fn read_reg(&mut self, name: &str) -> Result<u32> {
        match &mut self.backend {
            Backend::Katcp(client) => client.wordread(name).await,
            Backend::Simulated(sim) => sim.read_reg(name),
        }
        .with_context(|| format!("failed to read register {name}"))
    }

    /// Pulses a register `1 -> 0`.
    pub async fn reset_reg(&mut self, name: &str) -> Result<()> {
        self.set_reg(name, 1).await?;
        tokio::time::sleep(RESET_SETTLE).await;
        self.set_reg(name, 0).await
    }

    /// Writes the startup register values and pulses the reset registers.
    pub async fn apply_startup(&mut self, set: &[RegisterValue], reset: &[String]) -> Result<()> {
        for reg in set {
            self.set_reg(&reg.name, reg.val).await?;
        }
        for name in reset {
            self.reset_reg(name).await?;
        }
        Ok(())
    }

    async fn read_bytes(&mut self, name: &str, len: usize) -> Result<Vec<u8>> {
        match &mut self.backend {
            Backend::Katcp(client) => client.read(name, 0, len).await.map(|b| b.to_vec()),
            Backend::Simulated(sim) => sim.read_bytes(name, 0, len),
        }
        .with_context(|| format!("failed to read memory {name}"))
    }

    async fn write_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        match &mut self.backend {
            Backend::Katcp(client) => client.write(name, 0, data).await,
            Backend::Simulated(sim) => sim.write_bytes(name, 0, data),
        }
        .with_context(|| format!("failed to write memory {name}"))
    }

    async fn arm_snapshot(&mut self, name: &str, flags: u32) -> Result<()> {
        let ctrl = format!("{name}_ctrl");
        self.set_reg(&ctrl, 0).await?;
        self.set_reg(&ctrl, CTRL_ENABLE | flags).await
    }

    async fn read_snapshot(&mut self, name: &str, samples: usize) -> Result<Vec<i8>> {
        let status_reg = format!("{name}_status");
        let mut polls = 0;
        let size = loop {
            let status = self.read_reg(&status_reg).await?;
            if status & STATUS_BUSY == 0 {
                break (status & !STATUS_BUSY) as usize;
            }
            polls += 1;
            if polls == SNAPSHOT_MAX_POLLS {
                return Err(Error::Timeout(format!("snapshot {name}")).into());
            }
            tokio::time::sleep(SNAPSHOT_POLL).await;
        };
        anyhow::ensure!(
            samples <= size,
            "snapshot {name} holds {size} samples, {samples} requested"
        );
        let data = self.read_bytes(&format!("{name}_bram"), samples).await?;
        Ok(data.into_iter().map(|b| b as i8).collect())
    }

    /// Captures a snapshot with its own trigger.
    pub async fn snapshot(&mut self, name: &str, samples: usize) -> Result<Vec<i8>> {
        self.arm_snapshot(name, CTRL_MAN_TRIG).await?;
        self.read_snapshot(name, samples).await
    }

    /// Captures several snapshots on the same clock.
    ///
    /// The trigger register is cleared, every snapshot is armed to wait for
    /// the trigger, and the trigger is pulsed. The snapshots are then read
    /// without re-arming them.
    pub async fn snapshot_all_sync(
        &mut self,
        names: &[String],
        trig_reg: &str,
        samples: usize,
    ) -> Result<Vec<Vec<i8>>> {
        self.set_reg(trig_reg, 0).await?;
        for name in names {
            self.arm_snapshot(name, 0).await?;
        }
        self.set_reg(trig_reg, 1).await?;
        self.set_reg(trig_reg, 0).await?;
        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            snapshots.push(self.read_snapshot(name, samples).await?);
        }
        Ok(snapshots)
    }

    async fn read_named(&mut self, desc: &MemoryDesc, name: &str) -> Result<Vec<f64>> {
        let bytes = self.read_bytes(name, desc.nbytes()).await?;
        Ok(desc.dtype().decode(&bytes))
    }

    /// Reads a memory.
    pub async fn read_memory(&mut self, desc: &MemoryDesc) -> Result<Vec<f64>> {
        match desc.names() {
            BramNames::Name(name) => self.read_named(desc, name).await,
            _ => Err(Error::Config(format!("{}: expected bram_name", desc.key())).into()),
        }
    }

    /// Reads a list of memories.
    pub async fn read_group(&mut self, desc: &MemoryDesc) -> Result<Vec<Vec<f64>>> {
        let names = match desc.names() {
            BramNames::List(list) => list.clone(),
            _ => return Err(Error::Config(format!("{}: expected bram_list", desc.key())).into()),
        };
        let mut data = Vec::with_capacity(names.len());
        for name in &names {
            data.push(self.read_named(desc, name).await?);
        }
        Ok(data)
    }

    /// Reads a 2-D list of memories.
    pub async fn read_group2d(&mut self, desc: &MemoryDesc) -> Result<Vec<Vec<Vec<f64>>>> {
        let rows = match desc.names() {
            BramNames::List2d(rows) => rows.clone(),
            _ => {
                return Err(Error::Config(format!("{}: expected bram_list2d", desc.key())).into())
            }
        };
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut row_data = Vec::with_capacity(row.len());
            for name in row {
                row_data.push(self.read_named(desc, name).await?);
            }
            data.push(row_data);
        }
        Ok(data)
    }

    /// Reads a list of memories holding parallel lanes and interleaves them.
    pub async fn read_interleaved(&mut self, desc: &MemoryDesc) -> Result<Vec<f64>> {
        Ok(memory::interleave(&self.read_group(desc).await?))
    }

    /// Reads a 2-D list of memories and interleaves the lanes of each row.
    pub async fn read_group_interleaved(&mut self, desc: &MemoryDesc) -> Result<Vec<Vec<f64>>> {
        Ok(self
            .read_group2d(desc)
            .await?
            .iter()
            .map(|row| memory::interleave(row))
            .collect())
    }

    /// Reads the memories `names` with the word format of `desc` and
    /// interleaves them.
    pub async fn read_lanes(&mut self, desc: &MemoryDesc, names: &[String]) -> Result<Vec<f64>> {
        let mut lanes = Vec::with_capacity(names.len());
        for name in names {
            lanes.push(self.read_named(desc, name).await?);
        }
        Ok(memory::interleave(&lanes))
    }

    fn check_word<W: Word>(&mut self, desc: &MemoryDesc) {
        if !memory::word_matches::<W>(&desc.dtype()) {
            tracing::warn!(
                memory = desc.key(),
                dtype = %desc.dtype(),
                written = std::any::type_name::<W>(),
                "type mismatch writing memory"
            );
            self.type_mismatches += 1;
        }
    }

    async fn write_named<W: Word>(&mut self, desc: &MemoryDesc, name: &str, data: &[W]) -> Result<()> {
        anyhow::ensure!(
            data.len() <= desc.words(),
            "{} words do not fit in memory {name} of {} words",
            data.len(),
            desc.words()
        );
        let values: Vec<memory::Value> = data.iter().map(|w| w.value()).collect();
        self.write_bytes(name, &desc.dtype().encode(&values)).await
    }

    /// Writes a memory.
    ///
    /// If the element type does not match the dtype of the memory, a warning
    /// is logged and the values are converted.
    pub async fn write_memory<W: Word>(&mut self, desc: &MemoryDesc, data: &[W]) -> Result<()> {
        self.check_word::<W>(desc);
        match desc.names() {
            BramNames::Name(name) => self.write_named(desc, name, data).await,
            _ => Err(Error::Config(format!("{}: expected bram_name", desc.key())).into()),
        }
    }

    /// Writes a list of memories.
    pub async fn write_group<W: Word>(&mut self, desc: &MemoryDesc, data: &[Vec<W>]) -> Result<()> {
        self.check_word::<W>(desc);
        let names = match desc.names() {
            BramNames::List(list) => list.clone(),
            _ => return Err(Error::Config(format!("{}: expected bram_list", desc.key())).into()),
        };
        anyhow::ensure!(
            names.len() == data.len(),
            "{}: {} arrays for {} memories",
            desc.key(),
            data.len(),
            names.len()
        );
        for (name, values) in names.iter().zip(data.iter()) {
            self.write_named(desc, name, values).await?;
        }
        Ok(())
    }

    /// Writes a 2-D list of memories.
    pub async fn write_group2d<W: Word>(
        &mut self,
        desc: &MemoryDesc,
        data: &[Vec<Vec<W>>],
    ) -> Result<()> {
        self.check_word::<W>(desc);
        let rows = match desc.names() {
            BramNames::List2d(rows) => rows.clone(),
            _ => {
                return Err(Error::Config(format!("{}: expected bram_list2d", desc.key())).into())
            }
        };
        anyhow::ensure!(
            rows.len() == data.len() && rows.iter().zip(data).all(|(r, d)| r.len() == d.len()),
            "{}: array shape does not match the memories",
            desc.key()
        );
        for (row, values) in rows.iter().zip(data.iter()) {
            for (name, values) in row.iter().zip(values.iter()) {
                self.write_named(desc, name, values).await?;
            }
        }
        Ok(())
    }

    /// Splits data into lanes and writes each lane into the memories `names`
    /// with the word format of `desc`.
    pub async fn write_lanes<W: Word>(
        &mut self,
        desc: &MemoryDesc,
        names: &[String],
        data: &[W],
    ) -> Result<()> {
        self.check_word::<W>(desc);
        let lanes = memory::deinterleave(data, names.len());
        for (name, lane) in names.iter().zip(lanes.iter()) {
            self.write_named(desc, name, lane).await?;
        }
        Ok(())
    }

    /// Splits data into lanes and writes them into a list of memories.
    pub async fn write_interleaved<W: Word>(&mut self, desc: &MemoryDesc, data: &[W]) -> Result<()> {
        let names = match desc.names() {
            BramNames::List(list) => list.clone(),
            _ => return Err(Error::Config(format!("{}: expected bram_list", desc.key())).into()),
        };
        self.write_lanes(desc, &names, data).await
    }

    async fn write_fixed_lanes(
        &mut self,
        desc: &MemoryDesc,
        names: &[String],
        values: &[i64],
    ) -> Result<()> {
        // the words hold the two's complement of the fixed-point integers
        match desc.dtype().size {
            1 => {
                let words: Vec<i8> = values.iter().map(|&v| v as i8).collect();
                self.write_lanes(desc, names, &words).await
            }
            2 => {
                let words: Vec<i16> = values.iter().map(|&v| v as i16).collect();
                self.write_lanes(desc, names, &words).await
            }
            4 => {
                let words: Vec<i32> = values.iter().map(|&v| v as i32).collect();
                self.write_lanes(desc, names, &words).await
            }
            _ => self.write_lanes(desc, names, values).await,
        }
    }

    async fn write_float_lanes(
        &mut self,
        desc: &MemoryDesc,
        names: &[String],
        values: &[f64],
    ) -> Result<()> {
        if desc.dtype().size == 4 {
            let words: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            self.write_lanes(desc, names, &words).await
        } else {
            self.write_lanes(desc, names, values).await
        }
    }

    /// Writes coefficient rows into the memories of a coefficient descriptor.
    ///
    /// Row `j` of `rows` goes into the `[re, im]` row `j` of the descriptor.
    /// Integer memories receive the values quantized with `format`. Floating
    /// point memories receive them as they are. Returns the number of
    /// quantization overflows.
    pub async fn write_constants(
        &mut self,
        desc: &MemoryDesc,
        format: Format,
        rows: &[Vec<Complex64>],
    ) -> Result<usize> {
        let names = config::complex_rows(desc)?;
        anyhow::ensure!(
            rows.len() <= names.len(),
            "{}: {} coefficient rows for {} memory rows",
            desc.key(),
            rows.len(),
            names.len()
        );
        let mut overflows = 0;
        for ((re_names, im_names), values) in names.iter().zip(rows.iter()) {
            if desc.dtype().kind == Kind::Float {
                let re: Vec<f64> = values.iter().map(|z| z.re).collect();
                let im: Vec<f64> = values.iter().map(|z| z.im).collect();
                self.write_float_lanes(desc, re_names, &re).await?;
                self.write_float_lanes(desc, im_names, &im).await?;
            } else {
                let q = fixed::to_fixed_complex(format, values);
                overflows += q.overflows;
                self.write_fixed_lanes(desc, re_names, &q.re).await?;
                self.write_fixed_lanes(desc, im_names, &q.im).await?;
            }
        }
        Ok(overflows)
    }

    /// Reads the coefficient rows of a coefficient descriptor.
    pub async fn read_constants(
        &mut self,
        desc: &MemoryDesc,
        format: Format,
    ) -> Result<Vec<Vec<Complex64>>> {
        let scale = match desc.dtype().kind {
            Kind::Float => 1.0,
            _ => format.lsb(),
        };
        let mut rows = Vec::new();
        for (re_names, im_names) in config::complex_rows(desc)? {
            let re = self.read_lanes(desc, &re_names).await?;
            let im = self.read_lanes(desc, &im_names).await?;
            rows.push(
                re.into_iter()
                    .zip(im)
                    .map(|(a, b)| Complex64::new(a * scale, b * scale))
                    .collect(),
            );
        }
        Ok(rows)
    }

    /// Writes a phasor into a phasor bank.
    ///
    /// The phasor is saturated and quantized with the format of the bank. The
    /// data registers are written first, then the address registers, and
    /// finally the write-enable register is pulsed `0 -> 1 -> 0`. Returns the
    /// number of quantization overflows.
    pub async fn write_phasor(
        &mut self,
        bank: &PhasorBank,
        phasor: Complex64,
        address: &[u32],
    ) -> Result<usize> {
        anyhow::ensure!(
            address.len() == bank.addr_regs.len(),
            "phasor address {address:?} does not match {} address registers",
            bank.addr_regs.len()
        );
        let format = bank.format;
        let q = fixed::to_fixed_complex(format, &[fixed::saturate_complex(format, phasor)]);
        self.set_reg(&bank.re_reg, to_register(q.re[0], format.nbits()))
            .await?;
        self.set_reg(&bank.im_reg, to_register(q.im[0], format.nbits()))
            .await?;
        for (reg, &addr) in bank.addr_regs.iter().zip(address.iter()) {
            self.set_reg(reg, addr).await?;
        }
        self.set_reg(&bank.we_reg, 0).await?;
        self.set_reg(&bank.we_reg, 1).await?;
        self.set_reg(&bank.we_reg, 0).await?;
        tokio::time::sleep(PHASOR_SETTLE).await;
        Ok(q.overflows)
    }
}
