//! Device sessions.
//!
//! This module owns everything that happens between "connect to a device"
//! and "disconnect": the connection itself, the configuration database
//! session, RPC dispatch, verified file transfer and reboot.
//!
//! # Main Components
//!
//! - [`ConnectionManager`] - one device connection plus its configuration session
//! - [`ConnectionOptions`] / [`ConnectionParams`] - caller options and their validated form
//! - [`RpcRequest`] / [`RpcBatch`] - generic RPC dispatch
//! - [`ConfigChange`] - open, load, check, diff, commit and always close
//! - [`PingResult`] - loss and round-trip figures of a ping run from the device
//! - [`SessionRecorder`] - in-memory event log exportable as JSONL

use async_ssh2_tokio::ServerCheckMethod;
use log::{debug, trace, warn};
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    CommitPayload, ConfigFetch, DelegatedBackend, DirectBackend, LoadContent, LoadPayload,
    RebootRequest, ReplyBody, RpcCall, RpcReply, SessionBackend, junos,
};
use crate::config;
use crate::error::DeviceError;
use crate::logging::{self, LogSettings};
use crate::options::{
    ArgMap, ArgValue, ChecksumAlgorithm, ConfigFormat, ConfigMode, Database, IgnoreWarning,
    LoadAction, RollbackId, RpcFormat, WarningFilter, parse_bool,
};
use crate::output::OutputSink;
use crate::transport::{Connector, FileProtocol, NetconfConnector, TransferDirection};
use crate::xml::Element;

pub use configuration::{
    CommitOptions, ConfigOutput, ConfigRequest, ConfigSessionState, LoadRequest, LoadSource,
};
pub use manager::ConnectionManager;
pub use params::{
    ConnectionKind, ConnectionOptions, ConnectionParams, ConsoleSettings, Port, PortValue,
    SshConfigEntry, TransportMode, parse_console, ssh_config_lookup,
};
pub use ping::PingResult;
pub use reboot::{DefaultDisconnectClassifier, DisconnectClassifier, RebootOutcome, RebootResult};
pub use recording::{SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder};
pub use rpc::{BatchResult, RpcBatch, RpcRequest, RpcResult};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use transaction::{ChangeStage, ConfigChange, ConfigChangeSummary};
pub use transfer::{NO_FILE, TransferRecord, TransferStatus, checksum_bytes, local_checksum};

mod configuration;
mod manager;
mod params;
mod ping;
mod reboot;
mod recording;
mod rpc;
mod security;
mod transaction;
mod transfer;
