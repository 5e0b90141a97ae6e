//! Error types for device sessions, configuration transactions and transfers.
//!
//! Every fallible operation in this crate returns [`DeviceError`]. The
//! variants line up with the failure classes a caller has to tell apart:
//! connection problems, configuration lock problems, configuration
//! transaction failures, RPC failures, argument validation and transfer
//! integrity.

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

use crate::options::ChecksumAlgorithm;

/// Coarse failure class of a [`DeviceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    ConfigurationLock,
    Configuration,
    Rpc,
    Validation,
    TransferIntegrity,
    Internal,
}

/// Errors raised while driving a device.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The session to the device could not be established or was lost.
    #[error("{0}")]
    Connection(String),

    /// The device closed the session underneath an outstanding request.
    ///
    /// Distinct from [`DeviceError::Connection`] so that callers expecting a
    /// disconnect (reboot) can classify it.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// An RPC did not answer within the configured timeout.
    #[error("rpc timeout: {0}")]
    RpcTimeout(String),

    /// The configuration database could not be opened in the requested mode,
    /// or the mode/instance combination is invalid.
    #[error("{0}")]
    ConfigurationLock(String),

    /// Load, check, diff, commit, rollback or close of the configuration failed.
    #[error("{0}")]
    Configuration(String),

    /// A configuration operation was attempted without an open device and session.
    #[error("The device or configuration is not open.")]
    NotOpen,

    /// The device rejected an RPC or answered with an unexpected shape.
    #[error("{message}")]
    Rpc {
        message: String,
        /// Warning-severity messages that accompanied the failure.
        warnings: Vec<String>,
    },

    /// A caller-supplied value is invalid. Raised before any device interaction.
    #[error("{0}")]
    Validation(String),

    /// Checksums still differ after a transfer.
    #[error(
        "Transfer failed (different {} between local and remote) {local_checksum} | {remote_checksum}",
        .algorithm.label()
    )]
    TransferIntegrity {
        algorithm: ChecksumAlgorithm,
        local_checksum: String,
        remote_checksum: String,
    },

    /// Malformed XML received from the device or broker.
    #[error("xml error: {0}")]
    Xml(String),

    /// The delegated session broker returned an error object.
    #[error("broker error {code}: {message}")]
    Broker { code: i64, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// Failed to hand data to a transport I/O task.
    #[error("Failed to send data: {0}")]
    SendDataError(#[from] SendError<String>),
}

impl DeviceError {
    /// Shorthand for an RPC failure without warnings.
    pub fn rpc(message: impl Into<String>) -> Self {
        DeviceError::Rpc {
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Connection(_)
            | DeviceError::SessionClosed(_)
            | DeviceError::Ssh2Error(_)
            | DeviceError::RusshError(_)
            | DeviceError::SendDataError(_) => ErrorKind::Connection,
            DeviceError::ConfigurationLock(_) => ErrorKind::ConfigurationLock,
            DeviceError::Configuration(_) | DeviceError::NotOpen => ErrorKind::Configuration,
            DeviceError::Rpc { .. }
            | DeviceError::RpcTimeout(_)
            | DeviceError::Xml(_)
            | DeviceError::Broker { .. } => ErrorKind::Rpc,
            DeviceError::Validation(_) | DeviceError::Template(_) => ErrorKind::Validation,
            DeviceError::TransferIntegrity { .. } => ErrorKind::TransferIntegrity,
            DeviceError::Io(_) | DeviceError::Json(_) => ErrorKind::Internal,
        }
    }

    /// True when the error means the remote end is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DeviceError::SessionClosed(_)
                | DeviceError::Connection(_)
                | DeviceError::Ssh2Error(_)
                | DeviceError::RusshError(_)
                | DeviceError::SendDataError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_integrity_message_names_both_checksums() {
        let err = DeviceError::TransferIntegrity {
            algorithm: ChecksumAlgorithm::Md5,
            local_checksum: "aaa".to_string(),
            remote_checksum: "bbb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transfer failed (different MD5 between local and remote) aaa | bbb"
        );
        assert_eq!(err.kind(), ErrorKind::TransferIntegrity);

        let err = DeviceError::TransferIntegrity {
            algorithm: ChecksumAlgorithm::Sha256,
            local_checksum: "aaa".to_string(),
            remote_checksum: "bbb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transfer failed (different SHA256 between local and remote) aaa | bbb"
        );
    }

    #[test]
    fn not_open_uses_fixed_message() {
        assert_eq!(
            DeviceError::NotOpen.to_string(),
            "The device or configuration is not open."
        );
    }

    #[test]
    fn session_closed_counts_as_disconnect() {
        assert!(DeviceError::SessionClosed("eof".to_string()).is_disconnect());
        assert!(!DeviceError::rpc("bad").is_disconnect());
    }
}
