//! roachcal is a calibration toolbox for radio-astronomy digital backends
//! running on ROACH FPGA boards. It programs and configures the FPGA through
//! KATCP, drives the RF and LO signal sources, sweeps tones across the analog
//! band, computes per-channel correction coefficients for sideband-separating
//! receivers, balanced mixers, multi-beam formers and ADC synchronization,
//! writes them back into the FPGA, verifies them, and archives the results.
//!
//! Each experiment has its own program in `src/bin`. All of them can run
//! against a simulated ROACH and simulated sources.

#![warn(missing_docs)]

pub mod app;
pub mod archive;
pub mod args;
pub mod config;
pub mod error;
pub mod experiment;
pub mod fixed;
pub mod fpga;
pub mod instrument;
pub mod katcp;
pub mod memory;
pub mod plot;
pub mod sim;
pub mod solve;
pub mod spectra;
pub mod sweep;
