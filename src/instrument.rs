//! Signal source instruments.
//!
//! This module contains [`Instrument`], the façade over the signal generators
//! and synthesizers used by the experiments. Real instruments are driven with
//! short text commands over TCP, in the SCPI or Anritsu dialect. Simulated
//! instruments write their state into the [`Scene`] shared with the simulated
//! ROACH.
//!
//! Every command is followed by the settle delay of the driver. A command that
//! fails is retried once after reopening the connection. A second failure is
//! an [`Error::Instrument`].

use crate::{
    error::Error,
    sim::{Role, Scene, SimSource},
};
use anyhow::Result;
use roachcal_json::{SourceInfo, SourceKind};
use std::time::Duration;
use tokio::{io::AsyncWriteExt, net::TcpStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Port of the `TCPIP::host::INSTR` resources.
pub const INSTR_PORT: u16 = 5025;

/// Command dialect of a text-controlled instrument.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Dialect {
    /// SCPI.
    Scpi,
    /// Anritsu native commands.
    Anritsu,
}

/// Instrument command.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Command {
    /// Set the frequency in MHz.
    Frequency(f64),
    /// Set the power in dBm.
    Power(f64),
    /// Turn the output on or off.
    Output(bool),
}

impl Dialect {
    /// Formats a command, without the line terminator.
    pub fn format(&self, command: Command) -> String {
        match (self, command) {
            (Dialect::Scpi, Command::Frequency(f)) => format!("freq {f} mhz"),
            (Dialect::Scpi, Command::Power(p)) => format!("power {p} dbm"),
            (Dialect::Scpi, Command::Output(on)) => format!("outp {}", u8::from(on)),
            (Dialect::Anritsu, Command::Frequency(f)) => format!("F1 {f} MH"),
            (Dialect::Anritsu, Command::Power(p)) => format!("L1 {p} DM"),
            (Dialect::Anritsu, Command::Output(on)) => format!("RF{}", u8::from(on)),
        }
    }

    /// Delay after each command.
    pub fn settle_time(&self) -> Duration {
        match self {
            Dialect::Scpi => Duration::from_millis(50),
            Dialect::Anritsu => Duration::from_millis(100),
        }
    }
}

/// Parses an instrument connection string into a host and a port.
///
/// The accepted forms are `host:port`, `TCPIP::host::port::SOCKET` and
/// `TCPIP::host::INSTR`. The board number after `TCPIP` is ignored.
pub fn parse_connection(connection: &str) -> Result<(String, u16), Error> {
    let invalid = || Error::Config(format!("invalid instrument connection {connection:?}"));
    let port = |s: &str| s.parse::<u16>().map_err(|_| invalid());
    if connection.to_ascii_uppercase().starts_with("TCPIP") {
        let fields: Vec<&str> = connection.split("::").collect();
        return match fields.as_slice() {
            [_, host, "INSTR"] | [_, host, "inst0", "INSTR"] => Ok((host.to_string(), INSTR_PORT)),
            [_, host, p, "SOCKET"] => Ok((host.to_string(), port(*p)?)),
            _ => Err(invalid()),
        };
    }
    match connection.rsplit_once(':') {
        Some((host, p)) if !host.is_empty() => Ok((host.to_string(), port(p)?)),
        _ => Err(invalid()),
    }
}

/// Text-controlled instrument connected over TCP.
#[derive(Debug)]
pub struct TextInstrument {
    dialect: Dialect,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TextInstrument {
    /// Connects to an instrument.
    pub async fn connect(dialect: Dialect, connection: &str) -> Result<TextInstrument, Error> {
        let (host, port) = parse_connection(connection)?;
        let mut instrument = TextInstrument {
            dialect,
            host,
            port,
            stream: None,
        };
        instrument.reopen().await?;
        Ok(instrument)
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Command dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn reopen(&mut self) -> Result<(), Error> {
        self.stream = None;
        let target = self.target();
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::Timeout(format!("connection to {target}")))?
        .map_err(|e| Error::transport(&target, e))?;
        tracing::debug!(%target, "connected to instrument");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, command: Command) -> Result<(), Error> {
        let target = self.target();
        let mut line = self.dialect.format(command);
        tracing::trace!(%target, %line, "instrument command");
        line.push('\n');
        let stream = self.stream.as_mut().ok_or_else(|| Error::Transport {
            target: target.clone(),
            reason: "not connected".to_string(),
        })?;
        tokio::time::timeout(COMMAND_TIMEOUT, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::Timeout(format!("instrument {target}")))?
            .map_err(|e| Error::transport(&target, e))
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| Error::transport(self.target(), e))?;
        }
        Ok(())
    }
}

/// Instrument driver.
#[derive(Debug)]
pub enum Driver {
    /// Text commands over TCP.
    Text(TextInstrument),
    /// Simulated source.
    Sim(SimSource),
}

/// Signal source.
#[derive(Debug)]
pub struct Instrument {
    info: SourceInfo,
    driver: Driver,
    settle: Duration,
}

impl Instrument {
    /// Opens the instrument described by `info`.
    ///
    /// If `simulated` is set, or the source type is `sim`, the instrument is
    /// simulated and takes the given `role` in the `scene`.
    #[tracing::instrument(name = "Instrument::open", level = "debug", skip(info, scene), fields(connection = %info.connection))]
    pub async fn open(info: &SourceInfo, role: Role, scene: &Scene, simulated: bool) -> Result<Instrument> {
        let driver = if simulated || info.kind == SourceKind::Sim {
            Driver::Sim(SimSource::new(scene.clone(), role, info.freq_mult))
        } else {
            let dialect = match info.kind {
                SourceKind::Anritsu => Dialect::Anritsu,
                _ => Dialect::Scpi,
            };
            Driver::Text(TextInstrument::connect(dialect, &info.connection).await?)
        };
        Ok(Instrument::from_driver(info, driver))
    }

    /// Creates an instrument façade over a driver.
    pub fn from_driver(info: &SourceInfo, driver: Driver) -> Instrument {
        let settle = match (&driver, info.settle_time) {
            (_, Some(secs)) => Duration::from_secs_f64(secs.max(0.0)),
            (Driver::Text(text), None) => text.dialect().settle_time(),
            (Driver::Sim(_), None) => Duration::ZERO,
        };
        Instrument {
            info: info.clone(),
            driver,
            settle,
        }
    }

    /// Connection string of the instrument.
    pub fn name(&self) -> &str {
        &self.info.connection
    }

    /// Configuration of the instrument.
    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn try_command(&mut self, command: Command) -> Result<(), Error> {
        match &mut self.driver {
            Driver::Text(text) => text.send(command).await,
            Driver::Sim(sim) => {
                match command {
                    Command::Frequency(f) => sim.set_frequency(f),
                    Command::Power(p) => sim.set_power(p),
                    Command::Output(on) => sim.set_output(on),
                }
                Ok(())
            }
        }
    }

    /// Sends a command and waits for the settle time.
    ///
    /// A failed command is retried once after reopening the connection.
    pub async fn command(&mut self, command: Command) -> Result<()> {
        if let Err(err) = self.try_command(command).await {
            tracing::warn!(instrument = self.name(), ?command, %err, "instrument command failed, retrying");
            let retry = async {
                if let Driver::Text(text) = &mut self.driver {
                    text.reopen().await?;
                }
                self.try_command(command).await
            };
            if let Err(err) = retry.await {
                return Err(Error::Instrument {
                    name: self.info.connection.clone(),
                    reason: format!("{command:?} failed twice: {err}"),
                }
                .into());
            }
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Sets the frequency in MHz at the receiver input.
    ///
    /// Without a frequency the default frequency is used. The frequency sent
    /// to the device is divided by the frequency multiplier.
    pub async fn set_frequency(&mut self, mhz: Option<f64>) -> Result<()> {
        let mhz = mhz.unwrap_or(self.info.def_freq);
        self.command(Command::Frequency(mhz / self.info.freq_mult))
            .await
    }

    /// Sets the power in dBm. Without a power the default power is used.
    pub async fn set_power(&mut self, dbm: Option<f64>) -> Result<()> {
        let dbm = dbm.unwrap_or(self.info.def_power);
        self.command(Command::Power(dbm)).await
    }

    /// Turns the output on.
    pub async fn output_on(&mut self) -> Result<()> {
        self.command(Command::Output(true)).await
    }

    /// Turns the output off.
    pub async fn output_off(&mut self) -> Result<()> {
        self.command(Command::Output(false)).await
    }

    /// Closes the connection.
    pub async fn close(&mut self) -> Result<()> {
        if let Driver::Text(text) = &mut self.driver {
            text.close().await?;
        }
        Ok(())
    }
}

/// Sets the default frequency and power of every instrument and turns them
/// on, in order.
pub async fn init_all(instruments: &mut [&mut Instrument]) -> Result<()> {
    for instrument in instruments.iter_mut() {
        tracing::debug!(instrument = instrument.name(), "initializing source");
        instrument.set_frequency(None).await?;
        instrument.set_power(None).await?;
        instrument.output_on().await?;
    }
    Ok(())
}

/// Turns off and closes every instrument.
///
/// All the instruments are visited even if some of them fail. The failures
/// are logged.
pub async fn shutdown_all(instruments: &mut [&mut Instrument]) {
    for instrument in instruments.iter_mut() {
        if let Err(err) = instrument.output_off().await {
            tracing::error!(instrument = instrument.name(), "failed to turn off source: {err:#}");
        }
        if let Err(err) = instrument.close().await {
            tracing::error!(instrument = instrument.name(), "failed to close source: {err:#}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn info(kind: SourceKind, connection: &str) -> SourceInfo {
        SourceInfo {
            kind,
            connection: connection.to_string(),
            def_freq: 10_000.0,
            def_power: -10.0,
            freq_mult: 2.0,
            lo_freqs: Vec::new(),
            settle_time: Some(0.0),
        }
    }

    #[test]
    fn dialects() {
        assert_eq!(Dialect::Scpi.format(Command::Frequency(1500.0)), "freq 1500 mhz");
        assert_eq!(Dialect::Scpi.format(Command::Power(-3.5)), "power -3.5 dbm");
        assert_eq!(Dialect::Scpi.format(Command::Output(true)), "outp 1");
        assert_eq!(Dialect::Anritsu.format(Command::Frequency(1500.0)), "F1 1500 MH");
        assert_eq!(Dialect::Anritsu.format(Command::Power(-3.5)), "L1 -3.5 DM");
        assert_eq!(Dialect::Anritsu.format(Command::Output(false)), "RF0");
    }

    #[test]
    fn connection_strings() {
        assert_eq!(
            parse_connection("192.168.1.31:5025").unwrap(),
            ("192.168.1.31".to_string(), 5025)
        );
        assert_eq!(
            parse_connection("TCPIP::192.168.1.36::INSTR").unwrap(),
            ("192.168.1.36".to_string(), INSTR_PORT)
        );
        assert_eq!(
            parse_connection("TCPIP0::10.0.0.2::5000::SOCKET").unwrap(),
            ("10.0.0.2".to_string(), 5000)
        );
        assert!(parse_connection("GPIB0::7::INSTR").is_err());
        assert!(parse_connection("localhost").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_source_defaults() {
        let scene = Scene::new(0);
        let mut rf = Instrument::open(&info(SourceKind::Scpi, "1.2.3.4:5025"), Role::Rf, &scene, true)
            .await
            .unwrap();
        init_all(&mut [&mut rf]).await.unwrap();
        let state = scene.source(Role::Rf).unwrap();
        // the frequency at the receiver is the default frequency
        assert_eq!(state.freq, 10_000.0);
        assert_eq!(state.power, -10.0);
        assert!(state.on);
        shutdown_all(&mut [&mut rf]).await;
        assert!(!scene.source(Role::Rf).unwrap().on);
    }

    #[tokio::test]
    async fn scpi_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
            }
            received
        });
        let mut lo = Instrument::open(
            &info(SourceKind::Scpi, &addr.to_string()),
            Role::Lo(0),
            &Scene::new(1),
            false,
        )
        .await
        .unwrap();
        lo.set_frequency(Some(3000.0)).await.unwrap();
        lo.set_power(None).await.unwrap();
        lo.output_on().await.unwrap();
        lo.close().await.unwrap();
        assert_eq!(
            server.await.unwrap(),
            vec!["freq 1500 mhz", "power -10 dbm", "outp 1"]
        );
    }

    #[tokio::test]
    async fn second_failure_is_instrument_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut source = Instrument::open(
            &info(SourceKind::Anritsu, &addr.to_string()),
            Role::Rf,
            &Scene::new(0),
            false,
        )
        .await
        .unwrap();
        drop(listener);
        source.close().await.unwrap();
        let err = source.output_on().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Instrument { .. })
        ));
    }
}
