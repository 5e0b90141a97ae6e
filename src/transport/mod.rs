//! Transport adapters carrying NETCONF RPCs and file transfers.
//!
//! The session layer only sees the [`Transport`] and [`Connector`] traits.
//! [`NetconfConnector`] opens real sessions (SSH subsystem, SSH or telnet
//! console); [`ScriptedDevice`] answers from canned replies for tests and
//! dry runs.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::session::{ConnectionParams, TransportMode};

mod console;
mod ftp;
mod netconf;
mod scp;
mod scripted;
mod ssh;
mod telnet;

pub use netconf::{NETCONF_DELIMITER, NetconfSession};
pub use scripted::{ScriptedDevice, ScriptedReply, TransferCall};
pub use ssh::SshTransport;
pub use telnet::TelnetTransport;

/// File transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileProtocol {
    Scp,
    Ftp,
}

impl FileProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileProtocol::Scp => "scp",
            FileProtocol::Ftp => "ftp",
        }
    }
}

/// Direction of a file copy, seen from the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Put,
    Get,
}

impl fmt::Display for FileProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live management session to one device.
#[async_trait]
pub trait Transport: Send {
    /// Send one RPC body (the element inside `<rpc>`) and return the full
    /// `<rpc-reply>` document.
    async fn rpc(&mut self, request: &str, timeout: Duration) -> Result<String, DeviceError>;

    /// Copy a local file to the device. Returns the number of bytes sent.
    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError>;

    /// Copy a device file to the local host. Returns the number of bytes received.
    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError>;

    async fn close(&mut self) -> Result<(), DeviceError>;

    fn is_connected(&self) -> bool;
}

/// Opens transports from connection parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>, DeviceError>;
}

/// Connector for real devices.
///
/// Default mode opens the SSH `netconf` subsystem, or an SSH console
/// session when console server credentials are set. Telnet mode logs in
/// through a console server. Serial ports need a caller-supplied connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetconfConnector;

#[async_trait]
impl Connector for NetconfConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>, DeviceError> {
        debug!("[{}] connecting in {:?} mode", params.host, params.mode);
        match params.mode {
            TransportMode::Default if params.cs_user.is_some() => {
                Ok(Box::new(SshTransport::connect_console(params).await?))
            }
            TransportMode::Default => Ok(Box::new(SshTransport::connect(params).await?)),
            TransportMode::Telnet => Ok(Box::new(TelnetTransport::connect(params).await?)),
            TransportMode::Serial => Err(DeviceError::Connection(format!(
                "serial console {} is not supported by the built-in connector; supply a Connector",
                params.port
            ))),
        }
    }
}
