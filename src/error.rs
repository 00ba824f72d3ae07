//! Error taxonomy.
//!
//! This module contains the [`Error`] type, which classifies the failures that
//! the calibration procedures need to tell apart in order to apply their retry
//! and abort policies. Most of the crate returns [`anyhow::Result`], and these
//! errors travel inside [`anyhow::Error`] values. They are recovered with
//! [`anyhow::Error::downcast_ref`] where a policy depends on the kind.

/// roachcal error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O failure talking to the FPGA or to an instrument.
    #[error("transport error on {target}: {reason}")]
    Transport {
        /// Device or endpoint.
        target: String,
        /// Description of the failure.
        reason: String,
    },
    /// The register or memory is not present in the FPGA design.
    #[error("unknown register or memory {0}")]
    UnknownName(String),
    /// A device did not answer in time.
    #[error("timeout waiting for {0}")]
    Timeout(String),
    /// An instrument command failed.
    #[error("instrument {name}: {reason}")]
    Instrument {
        /// Instrument connection string.
        name: String,
        /// Description of the failure.
        reason: String,
    },
    /// Missing or invalid configuration key.
    #[error("configuration error: {0}")]
    Config(String),
    /// The operator cancelled the run.
    #[error("cancelled by the operator")]
    Cancelled,
}

impl Error {
    /// Creates a [`Error::Transport`] from an I/O error.
    pub fn transport(target: impl Into<String>, err: std::io::Error) -> Error {
        Error::Transport {
            target: target.into(),
            reason: err.to_string(),
        }
    }

    /// Returns `true` if an operation that failed with this error may be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout(_) | Error::Instrument { .. }
        )
    }
}

/// Returns `true` if any error in the chain of `err` is retryable.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<Error>())
        .any(Error::is_retryable)
}

/// Returns `true` if the chain of `err` contains [`Error::Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<Error>())
        .any(|e| matches!(e, Error::Cancelled))
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn retry_policy() {
        let err = anyhow::Error::from(Error::Timeout("wordread acc_len".to_string()));
        assert!(is_retryable(&err));
        let err: anyhow::Error = Err::<(), _>(Error::UnknownName("foo".to_string()))
            .context("reading foo")
            .unwrap_err();
        assert!(!is_retryable(&err));
        assert!(!is_cancelled(&err));
        let err = anyhow::Error::from(Error::Cancelled).context("sweep step 3");
        assert!(is_cancelled(&err));
    }

    #[test]
    fn message_names_target() {
        let err = Error::transport(
            "192.168.1.12:7147",
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        assert!(err.to_string().contains("192.168.1.12:7147"));
    }
}
