//! Canned-reply device for tests and dry runs.
//!
//! A [`ScriptedDevice`] is both a [`Connector`] and the [`Transport`] it
//! hands out. Clones share state, so a test keeps one handle for scripting
//! and inspection while the session layer owns another.
//!
//! Replies are keyed by the local name of the RPC root element. Each key
//! holds a queue; the last reply of a queue repeats for every further call.
//! Unscripted RPCs answer `<ok/>`, except `get-checksum-information`, which
//! is answered from the simulated remote filesystem.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{Connector, FileProtocol, TransferDirection, Transport};
use crate::error::DeviceError;
use crate::options::ChecksumAlgorithm;
use crate::session::{ConnectionParams, checksum_bytes};
use crate::xml::{Element, escape_text};

/// One scripted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Reply document. Wrapped in `<rpc-reply>` when it is not one already.
    Reply(String),
    /// The RPC never answers.
    Timeout,
    /// The device drops the session.
    Closed,
    /// The transport fails with the given message.
    Error(String),
}

impl From<&str> for ScriptedReply {
    fn from(reply: &str) -> Self {
        ScriptedReply::Reply(reply.to_string())
    }
}

impl From<String> for ScriptedReply {
    fn from(reply: String) -> Self {
        ScriptedReply::Reply(reply)
    }
}

/// A file copy performed through the scripted transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub direction: TransferDirection,
    pub protocol: FileProtocol,
    pub local: PathBuf,
    pub remote: String,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct DeviceState {
    rules: HashMap<String, VecDeque<ScriptedReply>>,
    calls: Vec<String>,
    transfers: Vec<TransferCall>,
    remote_files: HashMap<String, Vec<u8>>,
    corrupt_transfers: bool,
    fail_connect: Option<String>,
    connects: usize,
    connected: bool,
}

impl DeviceState {
    fn next_reply(&mut self, name: &str) -> Option<ScriptedReply> {
        let queue = self.rules.get_mut(name)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// Simulated device answering from scripted replies.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
}

fn wrap_reply(reply: &str) -> String {
    if reply.trim_start().starts_with("<rpc-reply") {
        reply.to_string()
    } else {
        format!("<rpc-reply>{reply}</rpc-reply>")
    }
}

fn no_such_file(path: &str) -> String {
    format!(
        "<rpc-reply><rpc-error><error-type>protocol</error-type><error-severity>error</error-severity><error-message>\n{}: No such file or directory\n</error-message></rpc-error></rpc-reply>",
        escape_text(path)
    )
}

fn corrupt(bytes: &mut Vec<u8>) {
    match bytes.last_mut() {
        Some(last) => *last ^= 0xff,
        None => bytes.push(0),
    }
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not hide the recorded calls.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a reply for RPCs whose root element is `rpc`.
    pub fn on(self, rpc: &str, reply: impl Into<ScriptedReply>) -> Self {
        self.state()
            .rules
            .entry(rpc.to_string())
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Place a file on the simulated device.
    pub fn remote_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.state().remote_files.insert(path.to_string(), contents.into());
        self
    }

    /// Flip a byte of every copied file.
    pub fn corrupt_transfers(self, corrupt: bool) -> Self {
        self.state().corrupt_transfers = corrupt;
        self
    }

    /// Make every connection attempt fail with `message`.
    pub fn fail_connect(self, message: impl Into<String>) -> Self {
        self.state().fail_connect = Some(message.into());
        self
    }

    /// Current contents of a simulated remote file.
    pub fn remote_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state().remote_files.get(path).cloned()
    }

    /// Every RPC body received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Root element names of every RPC received.
    pub fn rpc_names(&self) -> Vec<String> {
        self.calls().iter().map(|call| rpc_name(call)).collect()
    }

    /// Number of RPCs received with the given root element.
    pub fn count(&self, rpc: &str) -> usize {
        self.rpc_names().iter().filter(|name| *name == rpc).count()
    }

    pub fn transfers(&self) -> Vec<TransferCall> {
        self.state().transfers.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    fn checksum_reply(&self, request: &str) -> String {
        let Ok(element) = Element::parse(request) else {
            return wrap_reply("<ok/>");
        };
        let path = element.find_text("path").unwrap_or_default();
        let algorithm = element
            .find_text("type")
            .and_then(|t| t.parse::<ChecksumAlgorithm>().ok())
            .unwrap_or_default();
        match self.state().remote_files.get(&path) {
            Some(contents) => format!(
                "<rpc-reply><checksum-information><file-checksum><computation-method>{}</computation-method><input-file>{}</input-file><checksum>{}</checksum></file-checksum></checksum-information></rpc-reply>",
                algorithm.as_str().to_ascii_uppercase(),
                escape_text(&path),
                checksum_bytes(algorithm, contents)
            ),
            None => no_such_file(&path),
        }
    }
}

fn rpc_name(request: &str) -> String {
    match Element::parse(request) {
        Ok(element) => element.local_name().to_string(),
        Err(_) => request.trim().to_string(),
    }
}

#[async_trait]
impl Transport for ScriptedDevice {
    async fn rpc(&mut self, request: &str, _timeout: Duration) -> Result<String, DeviceError> {
        let name = rpc_name(request);
        let scripted = {
            let mut state = self.state();
            if !state.connected {
                return Err(DeviceError::SessionClosed("scripted device is not connected".to_string()));
            }
            state.calls.push(request.to_string());
            state.next_reply(&name)
        };
        debug!("[scripted] << {name}");
        match scripted {
            Some(ScriptedReply::Reply(reply)) => Ok(wrap_reply(&reply)),
            Some(ScriptedReply::Timeout) => Err(DeviceError::RpcTimeout(format!("{name} did not answer"))),
            Some(ScriptedReply::Closed) => {
                self.state().connected = false;
                Err(DeviceError::SessionClosed(format!("device closed the session during {name}")))
            }
            Some(ScriptedReply::Error(message)) => Err(DeviceError::Connection(message)),
            None if name == "get-checksum-information" => Ok(self.checksum_reply(request)),
            None => Ok(wrap_reply("<ok/>")),
        }
    }

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError> {
        let mut contents = tokio::fs::read(local).await?;
        let bytes = contents.len() as u64;
        let mut state = self.state();
        if state.corrupt_transfers {
            corrupt(&mut contents);
        }
        state.remote_files.insert(remote.to_string(), contents);
        state.transfers.push(TransferCall {
            direction: TransferDirection::Put,
            protocol,
            local: local.to_path_buf(),
            remote: remote.to_string(),
            bytes,
        });
        Ok(bytes)
    }

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError> {
        let contents = {
            let mut state = self.state();
            let contents = state
                .remote_files
                .get(remote)
                .cloned()
                .ok_or_else(|| DeviceError::rpc(format!("{remote}: No such file or directory")))?;
            state.transfers.push(TransferCall {
                direction: TransferDirection::Get,
                protocol,
                local: local.to_path_buf(),
                remote: remote.to_string(),
                bytes: contents.len() as u64,
            });
            let mut contents = contents;
            if state.corrupt_transfers {
                corrupt(&mut contents);
            }
            contents
        };
        let bytes = contents.len() as u64;
        tokio::fs::write(local, &contents).await?;
        Ok(bytes)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        let scripted = {
            let mut state = self.state();
            if !state.connected {
                return Ok(());
            }
            state.connected = false;
            state.calls.push("<close-session/>".to_string());
            state.next_reply("close-session")
        };
        match scripted {
            None | Some(ScriptedReply::Reply(_)) => Ok(()),
            Some(ScriptedReply::Timeout) => {
                Err(DeviceError::RpcTimeout("close-session did not answer".to_string()))
            }
            Some(ScriptedReply::Closed) => Err(DeviceError::SessionClosed(
                "device closed the session during close-session".to_string(),
            )),
            Some(ScriptedReply::Error(message)) => Err(DeviceError::Connection(message)),
        }
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[async_trait]
impl Connector for ScriptedDevice {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>, DeviceError> {
        let mut state = self.state();
        state.connects += 1;
        if let Some(message) = &state.fail_connect {
            return Err(DeviceError::Connection(message.clone()));
        }
        state.connected = true;
        drop(state);
        debug!("[{}] scripted device connected", params.host);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ScriptedDevice {
        let device = ScriptedDevice::new();
        device.state().connected = true;
        device
    }

    #[tokio::test]
    async fn last_reply_of_a_queue_repeats() {
        let mut device = connected()
            .on("get-system-uptime-information", "<first/>")
            .on("get-system-uptime-information", "<second/>");
        let timeout = Duration::from_secs(1);
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(
                device
                    .rpc("<get-system-uptime-information/>", timeout)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            replies,
            vec![
                "<rpc-reply><first/></rpc-reply>",
                "<rpc-reply><second/></rpc-reply>",
                "<rpc-reply><second/></rpc-reply>",
            ]
        );
        assert_eq!(device.count("get-system-uptime-information"), 3);
    }

    #[tokio::test]
    async fn checksum_requests_are_answered_from_remote_files() {
        let mut device = connected().remote_file("/var/tmp/a.txt", "hello");
        let reply = device
            .rpc(
                "<get-checksum-information><path>/var/tmp/a.txt</path></get-checksum-information>",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(reply.contains("<checksum>5d41402abc4b2a76b9719d911017c592</checksum>"));

        let missing = device
            .rpc(
                "<get-checksum-information><path>/var/tmp/b.txt</path></get-checksum-information>",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(missing.contains("No such file or directory"));
    }

    #[tokio::test]
    async fn closed_reply_disconnects() {
        let mut device = connected().on("request-reboot", ScriptedReply::Closed);
        let err = device
            .rpc("<request-reboot/>", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::SessionClosed(_)));
        assert!(!device.is_connected());
    }
}
