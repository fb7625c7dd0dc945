//! 🏷️ Errors with names: because "something went wrong" is not a postmortem.
//!
//! 📜 Three flavors, one for each way a bulk load can disappoint you:
//! - `Configuration`: you told us to do something impossible. We refuse before touching the network.
//! - `StreamFormat`: the bytes on disk are not what the reader was promised.
//! - `Write`: the store said no. Loudly. Mid-transaction.
//!
//! Everything still travels as `anyhow::Error` with context chains (the house style). These
//! variants ride inside, so whoever cares can `downcast_ref::<PumpError>()` and find out
//! which kind of bad day it is. 🦆

use thiserror::Error;

/// 💀 The typed failure kinds of a transfer job.
#[derive(Debug, Error)]
pub enum PumpError {
    /// 🔧 Fails fast, before any I/O. Malformed grants, dirty destination, fast path + auto dirs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 📄 The source stream is broken beyond what record-skipping can fix.
    #[error("stream format error in '{source_name}': {reason}")]
    StreamFormat { source_name: String, reason: String },

    /// 📡 A batch or transaction submission failed. The enclosing transaction was rolled back.
    #[error("write error against '{host}': {reason}")]
    Write { host: String, reason: String },
}

impl PumpError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub(crate) fn stream(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StreamFormat {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Write {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

/// 🔍 Is this anyhow error, somewhere in its chain, a configuration error?
/// The CLI uses this to decide between "fix your TOML" and "check your cluster".
pub fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PumpError>(),
            Some(PumpError::Configuration(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn the_one_where_a_config_error_survives_a_context_sandwich() {
        let err: anyhow::Result<()> = Err(anyhow::Error::from(PumpError::config("odd grants")))
            .context("💀 preflight said no");
        let err = err.expect_err("should be an error, it's literally constructed as one");
        assert!(is_configuration_error(&err));
    }

    #[test]
    fn the_one_where_a_write_error_is_not_mistaken_for_bad_config() {
        let err = anyhow::Error::from(PumpError::write("h1", "503"));
        assert!(!is_configuration_error(&err));
        assert_eq!(err.to_string(), "write error against 'h1': 503");
    }
}
