//! Execution strategies behind the connection manager.
//!
//! A connection is either driven locally ([`DirectBackend`], NETCONF over a
//! [`Transport`](crate::transport::Transport)) or forwarded to an external
//! session broker ([`DelegatedBackend`]). The choice is made once when the
//! manager is built; everything above this module talks to
//! [`SessionBackend`] only.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DeviceError;
use crate::options::{
    ArgMap, ChecksumAlgorithm, ConfigFormat, ConfigMode, Database, LoadAction, RollbackId,
    RpcFormat, WarningFilter,
};
use crate::transport::FileProtocol;
use crate::xml::Element;

mod delegated;
mod direct;
pub(crate) mod junos;

pub use delegated::DelegatedBackend;
pub use direct::DirectBackend;

/// Which side executes device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Direct,
    Delegated,
}

/// A generic RPC invocation.
#[derive(Debug, Clone)]
pub struct RpcCall {
    /// RPC name with dashes.
    pub name: String,
    /// Child elements. Booleans render as empty markers, whatever their value.
    pub kwargs: ArgMap,
    /// Attributes of the RPC element.
    pub attrs: ArgMap,
    pub format: RpcFormat,
    pub ignore_warning: WarningFilter,
}

impl RpcCall {
    pub fn new(name: impl Into<String>, format: RpcFormat) -> Self {
        Self {
            name: name.into(),
            kwargs: ArgMap::new(),
            attrs: ArgMap::new(),
            format,
            ignore_warning: WarningFilter::none(),
        }
    }
}

/// A configuration retrieval.
#[derive(Debug, Clone)]
pub struct ConfigFetch {
    pub database: Database,
    pub format: ConfigFormat,
    /// Extra attributes of `get-configuration`.
    pub options: ArgMap,
    /// XML subtree or `/`-separated hierarchy.
    pub filter: Option<String>,
    /// `openconfig`, `ietf` or `custom`.
    pub model: Option<String>,
    pub namespace: Option<String>,
    pub remove_ns: bool,
}

impl Default for ConfigFetch {
    fn default() -> Self {
        Self {
            database: Database::Committed,
            format: ConfigFormat::Xml,
            options: ArgMap::new(),
            filter: None,
            model: None,
            namespace: None,
            remove_ns: true,
        }
    }
}

/// Configuration text to load, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadContent {
    Text(String),
    Url(String),
}

/// A configuration load.
#[derive(Debug, Clone)]
pub struct LoadPayload {
    pub action: LoadAction,
    pub format: ConfigFormat,
    pub content: LoadContent,
    pub ignore_warning: WarningFilter,
}

/// A commit request.
#[derive(Debug, Clone)]
pub struct CommitPayload {
    pub comment: Option<String>,
    /// Minutes before an unconfirmed commit is rolled back.
    pub confirmed: Option<u32>,
    pub timeout: Duration,
    pub full: bool,
    pub sync: bool,
    pub force_sync: bool,
    pub ignore_warning: WarningFilter,
}

/// A reboot request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootRequest {
    /// Reboot every routing engine.
    pub all_re: bool,
    /// Reboot the VM host instead of Junos only.
    pub vmhost: bool,
    /// Virtual chassis member.
    pub member_id: Option<String>,
    /// Delay in minutes.
    pub in_minutes: Option<u32>,
    /// Absolute time, `yymmddhhmm`.
    pub at: Option<String>,
}

/// Reply content before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// `<ok/>` or an empty reply.
    Ok,
    Element(Element),
    Json(Value),
    Text(String),
}

/// Reply of an RPC together with the warnings that were ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub body: ReplyBody,
    pub warnings: Vec<String>,
}

impl RpcReply {
    pub fn ok() -> Self {
        Self {
            body: ReplyBody::Ok,
            warnings: Vec::new(),
        }
    }
}

/// Device operations as seen by the connection manager.
#[async_trait]
pub trait SessionBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Establish the connection to the device (or the broker).
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Tear the connection down. The handle is released before teardown so a
    /// failing close leaves the backend closed.
    async fn close(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    /// Default RPC timeout.
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    async fn open_configuration(
        &mut self,
        mode: ConfigMode,
        ephemeral_instance: Option<&str>,
        ignore_warning: &WarningFilter,
    ) -> Result<(), DeviceError>;

    async fn close_configuration(&mut self, mode: ConfigMode) -> Result<(), DeviceError>;

    async fn get_configuration(&mut self, fetch: &ConfigFetch) -> Result<RpcReply, DeviceError>;

    async fn load_configuration(&mut self, payload: &LoadPayload) -> Result<(), DeviceError>;

    async fn check_configuration(&mut self) -> Result<(), DeviceError>;

    /// Candidate against rollback 0. `None` when there is no difference.
    async fn diff_configuration(
        &mut self,
        ignore_warning: &WarningFilter,
    ) -> Result<Option<String>, DeviceError>;

    async fn commit_configuration(&mut self, payload: &CommitPayload) -> Result<(), DeviceError>;

    async fn rollback_configuration(&mut self, id: RollbackId) -> Result<(), DeviceError>;

    async fn rpc(&mut self, call: &RpcCall) -> Result<RpcReply, DeviceError>;

    /// Checksum of a file on the device.
    async fn checksum(
        &mut self,
        path: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, DeviceError>;

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError>;

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError>;

    async fn reboot(&mut self, request: &RebootRequest) -> Result<RpcReply, DeviceError>;

    /// Run the `ping` RPC and return its `ping-results` element.
    async fn ping(&mut self, call: &RpcCall) -> Result<Element, DeviceError>;
}
