//! Backend that forwards every operation to an external session broker.
//!
//! Frames are an 8-byte big-endian length followed by a JSON-RPC 2.0 object.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{
    BackendKind, CommitPayload, ConfigFetch, LoadContent, LoadPayload, RebootRequest, ReplyBody,
    RpcCall, RpcReply, SessionBackend, junos,
};
use crate::error::DeviceError;
use crate::options::{
    ChecksumAlgorithm, ConfigFormat, ConfigMode, RollbackId, RpcFormat, WarningFilter,
};
use crate::session::ConnectionParams;
use crate::transport::FileProtocol;
use crate::xml::Element;

/// Largest frame accepted from the broker.
const MAX_FRAME: usize = 256 * 1024 * 1024;

/// 8-byte big-endian length prefix.
fn broker_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(8)
        .big_endian()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

/// Map a broker error object onto the local taxonomy.
fn broker_error(error: ErrorObject) -> DeviceError {
    if error.message.contains("ConnectError") {
        DeviceError::Connection(error.message)
    } else if error.message.contains("RpcError") {
        DeviceError::rpc(error.message)
    } else {
        DeviceError::Broker {
            code: error.code,
            message: error.message,
        }
    }
}

/// Convert a broker result into a reply body.
///
/// Strings starting with `<` are parsed as XML; an `rpc-reply` wrapper is
/// unwrapped to its first element.
fn reply_from_result(
    result: Value,
    json: bool,
    max_depth: Option<usize>,
) -> Result<RpcReply, DeviceError> {
    let body = match result {
        Value::Null | Value::Bool(true) => ReplyBody::Ok,
        Value::String(text) => {
            let trimmed = text.trim_start();
            if json {
                ReplyBody::Json(serde_json::from_str(trimmed)?)
            } else if trimmed.starts_with('<') {
                let root = Element::parse_with_depth(trimmed, max_depth)?;
                if root.local_name() == "rpc-reply" {
                    match root.elements().next() {
                        Some(el) if el.local_name() == "ok" => ReplyBody::Ok,
                        Some(el) => ReplyBody::Element(el.clone()),
                        None => match root.text().trim() {
                            "" => ReplyBody::Ok,
                            t => ReplyBody::Text(t.to_string()),
                        },
                    }
                } else {
                    ReplyBody::Element(root)
                }
            } else {
                ReplyBody::Text(text)
            }
        }
        other => ReplyBody::Json(other),
    };
    Ok(RpcReply {
        body,
        warnings: Vec::new(),
    })
}

/// Forwards operations over a Unix socket to a broker that owns the device session.
pub struct DelegatedBackend {
    socket_path: PathBuf,
    params: ConnectionParams,
    stream: Option<Framed<UnixStream, LengthDelimitedCodec>>,
    next_id: u64,
    timeout: Duration,
    label: String,
}

impl DelegatedBackend {
    pub fn new(socket_path: impl Into<PathBuf>, params: ConnectionParams) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: params.timeout,
            label: format!("[{}]", params.host),
            params,
            stream: None,
            next_id: 1,
        }
    }

    async fn exchange(&mut self, payload: Vec<u8>) -> Result<Bytes, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotOpen)?;
        stream.send(Bytes::from(payload)).await.map_err(|e| {
            DeviceError::SessionClosed(format!("broker connection failed: {e}"))
        })?;
        match stream.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => Err(DeviceError::rpc(
                format!("broker frame rejected: {e}"),
            )),
            Some(Err(e)) => Err(DeviceError::SessionClosed(format!(
                "broker connection failed: {e}"
            ))),
            None => Err(DeviceError::SessionClosed(
                "broker closed the connection".to_string(),
            )),
        }
    }

    async fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DeviceError> {
        let id = self.next_id;
        self.next_id += 1;
        let payload = serde_json::to_vec(&Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        trace!("{} broker request {}: {}", self.label, id, method);

        let body = match tokio::time::timeout(timeout, self.exchange(payload)).await {
            Ok(body) => body,
            Err(_) => {
                // A late reply would be taken for the answer to the next request.
                self.stream = None;
                return Err(DeviceError::RpcTimeout(format!(
                    "{} broker did not answer {method} within {timeout:?}",
                    self.label
                )));
            }
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                if err.is_disconnect() {
                    self.stream = None;
                }
                return Err(err);
            }
        };

        let response: Response = serde_json::from_slice(&body)?;
        if response.id.is_some_and(|rid| rid != id) {
            return Err(DeviceError::rpc(format!(
                "broker answered request {:?} while {id} was outstanding",
                response.id
            )));
        }
        match response.error {
            Some(error) => Err(broker_error(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, DeviceError> {
        self.request(method, params, self.timeout).await
    }

    async fn copy(
        &mut self,
        protocol: FileProtocol,
        direction: &str,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError> {
        let method = format!("{protocol}_file_copy_{direction}");
        let result = self
            .call(
                &method,
                json!({ "local_file": local.display().to_string(), "remote_file": remote }),
            )
            .await?;
        Ok(result.as_u64().unwrap_or(0))
    }
}

#[async_trait]
impl SessionBackend for DelegatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Delegated
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            DeviceError::Connection(format!(
                "broker socket {} is not reachable: {e}",
                self.socket_path.display()
            ))
        })?;
        self.stream = Some(Framed::new(stream, broker_codec()));
        debug!(
            "{} connected to session broker at {}",
            self.label,
            self.socket_path.display()
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = self.call("close", Value::Null).await.map(|_| ());
        self.stream = None;
        debug!("{} broker session closed", self.label);
        result
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn open_configuration(
        &mut self,
        mode: ConfigMode,
        ephemeral_instance: Option<&str>,
        ignore_warning: &WarningFilter,
    ) -> Result<(), DeviceError> {
        let params = json!({
            "mode": mode.as_str(),
            "ignore_warning": ignore_warning.to_option(),
            "ephemeral_instance": ephemeral_instance,
        });
        self.call("open_configuration", params).await?;
        Ok(())
    }

    async fn close_configuration(&mut self, _mode: ConfigMode) -> Result<(), DeviceError> {
        self.call("close_configuration", Value::Null).await?;
        Ok(())
    }

    async fn get_configuration(&mut self, fetch: &ConfigFetch) -> Result<RpcReply, DeviceError> {
        let mut options = serde_json::Map::new();
        for (key, value) in &fetch.options {
            options.insert(key.clone(), serde_json::to_value(value)?);
        }
        options.insert("database".into(), json!(fetch.database.as_str()));
        options.insert("format".into(), json!(fetch.format.as_str()));
        let filter_xml = fetch
            .filter
            .as_deref()
            .map(junos::filter_element)
            .transpose()?
            .map(|el| el.to_xml());
        let params = json!({
            "filter_xml": filter_xml,
            "options": options,
            "model": fetch.model,
            "namespace": fetch.namespace,
            "remove_ns": fetch.remove_ns,
        });
        let result = self.call("get_config", params).await?;
        let mut reply = reply_from_result(
            result,
            fetch.format == ConfigFormat::Json,
            self.params.max_xml_depth(),
        )?;
        if fetch.remove_ns
            && let ReplyBody::Element(el) = &mut reply.body
        {
            el.strip_namespaces();
        }
        Ok(reply)
    }

    async fn load_configuration(&mut self, payload: &LoadPayload) -> Result<(), DeviceError> {
        let mut load_args = serde_json::Map::new();
        load_args.insert("action".into(), json!(payload.action.as_str()));
        load_args.insert("format".into(), json!(payload.format.as_str()));
        load_args.insert(
            "ignore_warning".into(),
            serde_json::to_value(payload.ignore_warning.to_option())?,
        );
        let config = match &payload.content {
            LoadContent::Text(text) => Value::String(text.clone()),
            LoadContent::Url(url) => {
                load_args.insert("url".into(), json!(url));
                Value::Null
            }
        };
        self.call(
            "load_configuration",
            json!({ "config": config, "load_args": load_args }),
        )
        .await?;
        Ok(())
    }

    async fn check_configuration(&mut self) -> Result<(), DeviceError> {
        self.call("check_configuration", Value::Null).await?;
        Ok(())
    }

    async fn diff_configuration(
        &mut self,
        ignore_warning: &WarningFilter,
    ) -> Result<Option<String>, DeviceError> {
        let result = self
            .call(
                "diff_configuration",
                json!({ "ignore_warning": ignore_warning.to_option() }),
            )
            .await?;
        Ok(result
            .as_str()
            .filter(|diff| !diff.trim().is_empty())
            .map(str::to_string))
    }

    async fn commit_configuration(&mut self, payload: &CommitPayload) -> Result<(), DeviceError> {
        let params = json!({
            "ignore_warning": payload.ignore_warning.to_option(),
            "comment": payload.comment,
            "confirmed": payload.confirmed,
            "timeout": payload.timeout.as_secs(),
            "full": payload.full,
            "sync": payload.sync,
            "force_sync": payload.force_sync,
        });
        self.request("commit_configuration", params, payload.timeout)
            .await?;
        Ok(())
    }

    async fn rollback_configuration(&mut self, id: RollbackId) -> Result<(), DeviceError> {
        self.call("rollback_configuration", json!({ "id": Value::from(id) }))
            .await?;
        Ok(())
    }

    async fn rpc(&mut self, call: &RpcCall) -> Result<RpcReply, DeviceError> {
        let params = json!({
            "rpc": junos::rpc_element(call).to_dict(),
            "ignore_warning": call.ignore_warning.to_option(),
            "format": call.format.as_str(),
        });
        let result = self.call("get_rpc_resp", params).await?;
        reply_from_result(
            result,
            call.format == RpcFormat::Json,
            self.params.max_xml_depth(),
        )
    }

    async fn checksum(
        &mut self,
        path: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, DeviceError> {
        let result = self
            .call(
                "get_checksum_information",
                json!({ "path": path, "algorithm": algorithm.as_str() }),
            )
            .await?;
        let reply = reply_from_result(result, false, self.params.max_xml_depth())?;
        match &reply.body {
            ReplyBody::Text(text) => Ok(text.trim().to_string()),
            _ => junos::checksum_value(&reply),
        }
    }

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError> {
        self.copy(protocol, "put", local, remote).await
    }

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError> {
        self.copy(protocol, "get", local, remote).await
    }

    async fn reboot(&mut self, request: &RebootRequest) -> Result<RpcReply, DeviceError> {
        let params = json!({
            "all_re": request.all_re,
            "in_min": request.in_minutes.unwrap_or(0),
            "at": request.at,
            "vmhost": request.vmhost,
            "member_id": request.member_id,
        });
        let result = self.call("reboot_api", params).await?;
        reply_from_result(result, false, self.params.max_xml_depth())
    }

    async fn ping(&mut self, call: &RpcCall) -> Result<Element, DeviceError> {
        let mut params = serde_json::Map::new();
        params.insert("normalize".into(), json!(true));
        for (key, value) in &call.kwargs {
            params.insert(key.clone(), serde_json::to_value(value)?);
        }
        match self.call("ping_device", Value::Object(params)).await? {
            Value::String(text) => junos::ping_results(&text, self.params.max_xml_depth()),
            other => Err(DeviceError::rpc(format!("Unexpected ping response: {other}"))),
        }
    }
}
