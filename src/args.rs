//! roachcal CLI arguments.
//!
//! This module contains the definition of the CLI arguments shared by all the
//! roachcal programs.

use clap::Parser;
use std::path::PathBuf;

/// roachcal CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (JSON)
    pub config: PathBuf,
}
