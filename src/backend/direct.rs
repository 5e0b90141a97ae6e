use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};

use super::{
    BackendKind, CommitPayload, ConfigFetch, LoadPayload, RebootRequest, ReplyBody, RpcCall,
    RpcReply, SessionBackend, junos,
};
use crate::error::DeviceError;
use crate::options::{
    ChecksumAlgorithm, ConfigFormat, ConfigMode, RollbackId, RpcFormat, WarningFilter,
};
use crate::session::ConnectionParams;
use crate::transport::{Connector, FileProtocol, Transport};
use crate::xml::Element;

/// Drives the device through a [`Transport`] opened by a [`Connector`].
pub struct DirectBackend {
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    transport: Option<Box<dyn Transport>>,
    timeout: Duration,
    label: String,
}

impl DirectBackend {
    pub fn new(connector: Arc<dyn Connector>, params: ConnectionParams) -> Self {
        Self {
            timeout: params.timeout,
            label: format!("[{}]", params.host),
            connector,
            params,
            transport: None,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, DeviceError> {
        self.transport.as_mut().ok_or(DeviceError::NotOpen)
    }

    async fn call(
        &mut self,
        request: &str,
        timeout: Duration,
        json: bool,
        filter: &WarningFilter,
    ) -> Result<RpcReply, DeviceError> {
        let max_depth = self.params.max_xml_depth();
        trace!("{} rpc: {}", self.label, request);
        let raw = self.transport()?.rpc(request, timeout).await?;
        junos::parse_reply(&raw, json, filter, max_depth)
    }
}

#[async_trait]
impl SessionBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        if self.is_open() {
            return Ok(());
        }
        if let Some(mut stale) = self.transport.take() {
            debug!("{} Releasing the dropped transport before reconnecting.", self.label);
            if let Err(e) = stale.close().await {
                debug!("{} Ignoring error while releasing the transport: {}", self.label, e);
            }
        }
        debug!("{} Creating device parameters: {:?}", self.label, self.params);
        let transport = self.connector.connect(&self.params).await?;
        self.transport = Some(transport);
        debug!("{} Device opened, default timeout {:?}", self.label, self.timeout);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        match self.transport.take() {
            Some(mut transport) => {
                let result = transport.close().await;
                debug!("{} Device closed.", self.label);
                result
            }
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
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
        let request = match mode {
            ConfigMode::Exclusive => junos::LOCK.to_string(),
            other => junos::open_configuration(other, ephemeral_instance).to_xml(),
        };
        self.call(&request, self.timeout, false, ignore_warning).await?;
        Ok(())
    }

    async fn close_configuration(&mut self, mode: ConfigMode) -> Result<(), DeviceError> {
        let request = match mode {
            ConfigMode::Exclusive => junos::UNLOCK,
            _ => junos::CLOSE_CONFIGURATION,
        };
        self.call(request, self.timeout, false, &WarningFilter::none())
            .await?;
        Ok(())
    }

    async fn get_configuration(&mut self, fetch: &ConfigFetch) -> Result<RpcReply, DeviceError> {
        let request = junos::get_configuration(fetch)?.to_xml();
        let json = fetch.format == ConfigFormat::Json;
        let mut reply = self
            .call(&request, self.timeout, json, &WarningFilter::none())
            .await?;
        if fetch.remove_ns
            && let ReplyBody::Element(el) = &mut reply.body
        {
            el.strip_namespaces();
        }
        Ok(reply)
    }

    async fn load_configuration(&mut self, payload: &LoadPayload) -> Result<(), DeviceError> {
        let request = junos::load_configuration(payload)?.to_xml();
        self.call(&request, self.timeout, false, &payload.ignore_warning)
            .await?;
        Ok(())
    }

    async fn check_configuration(&mut self) -> Result<(), DeviceError> {
        self.call(junos::COMMIT_CHECK, self.timeout, false, &WarningFilter::none())
            .await?;
        Ok(())
    }

    async fn diff_configuration(
        &mut self,
        ignore_warning: &WarningFilter,
    ) -> Result<Option<String>, DeviceError> {
        let reply = self
            .call(junos::DIFF, self.timeout, false, ignore_warning)
            .await?;
        Ok(junos::diff_text(&reply))
    }

    async fn commit_configuration(&mut self, payload: &CommitPayload) -> Result<(), DeviceError> {
        let request = junos::commit_configuration(payload).to_xml();
        self.call(&request, payload.timeout, false, &payload.ignore_warning)
            .await?;
        Ok(())
    }

    async fn rollback_configuration(&mut self, id: RollbackId) -> Result<(), DeviceError> {
        let request = junos::rollback(id).to_xml();
        self.call(&request, self.timeout, false, &WarningFilter::none())
            .await?;
        Ok(())
    }

    async fn rpc(&mut self, call: &RpcCall) -> Result<RpcReply, DeviceError> {
        let request = junos::rpc_element(call).to_xml();
        let json = call.format == RpcFormat::Json;
        self.call(&request, self.timeout, json, &call.ignore_warning)
            .await
    }

    async fn checksum(
        &mut self,
        path: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, DeviceError> {
        let request = junos::checksum(path, algorithm).to_xml();
        let reply = self
            .call(&request, self.timeout, false, &WarningFilter::none())
            .await?;
        junos::checksum_value(&reply)
    }

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError> {
        self.transport()?.put_file(protocol, local, remote).await
    }

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError> {
        self.transport()?.get_file(protocol, remote, local).await
    }

    async fn reboot(&mut self, request: &RebootRequest) -> Result<RpcReply, DeviceError> {
        let request = junos::reboot(request).to_xml();
        self.call(&request, self.timeout, false, &WarningFilter::none())
            .await
    }

    async fn ping(&mut self, call: &RpcCall) -> Result<Element, DeviceError> {
        let request = junos::rpc_element(call).to_xml();
        let timeout = self.timeout;
        let max_depth = self.params.max_xml_depth();
        trace!("{} rpc: {}", self.label, request);
        let raw = self.transport()?.rpc(&request, timeout).await?;
        junos::ping_results(&raw, max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingTransport {
        connected: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn rpc(&mut self, _request: &str, _timeout: Duration) -> Result<String, DeviceError> {
            Ok("<rpc-reply><ok/></rpc-reply>".to_string())
        }

        async fn put_file(
            &mut self,
            _protocol: FileProtocol,
            _local: &Path,
            _remote: &str,
        ) -> Result<u64, DeviceError> {
            Ok(0)
        }

        async fn get_file(
            &mut self,
            _protocol: FileProtocol,
            _remote: &str,
            _local: &Path,
        ) -> Result<u64, DeviceError> {
            Ok(0)
        }

        async fn close(&mut self) -> Result<(), DeviceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(DeviceError::SessionClosed("already gone".to_string()))
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: Mutex<Vec<Arc<AtomicBool>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _params: &ConnectionParams) -> Result<Box<dyn Transport>, DeviceError> {
            let connected = Arc::new(AtomicBool::new(true));
            self.opened.lock().unwrap().push(connected.clone());
            Ok(Box::new(CountingTransport {
                connected,
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn dropped_transport_is_closed_before_reconnecting() {
        let connector = Arc::new(CountingConnector::default());
        let mut backend = DirectBackend::new(connector.clone(), ConnectionParams::new("r1", "admin"));
        backend.open().await.unwrap();
        connector.opened.lock().unwrap()[0].store(false, Ordering::SeqCst);
        assert!(!backend.is_open());

        backend.open().await.unwrap();
        assert!(backend.is_open());
        assert_eq!(connector.opened.lock().unwrap().len(), 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }
}
