use super::*;

/// One device connection and the configuration session held on it.
///
/// The manager owns exactly one backend, chosen at construction, and
/// tracks the configuration session itself so release is check-before-act:
/// [`ConnectionManager::terminate`] can be called on any exit path and only
/// undoes what is actually open.
pub struct ConnectionManager {
    pub(super) params: ConnectionParams,
    pub(super) backend: Box<dyn SessionBackend>,
    pub(super) config_state: ConfigSessionState,
    pub(super) recorder: Option<SessionRecorder>,
    pub(super) label: String,
}

impl ConnectionManager {
    /// Manager for validated parameters.
    ///
    /// Local connections use [`NetconfConnector`]; delegated connections
    /// forward to the broker socket named in the parameters.
    pub fn new(params: ConnectionParams) -> Self {
        let backend: Box<dyn SessionBackend> = match &params.kind {
            ConnectionKind::Local => {
                Box::new(DirectBackend::new(Arc::new(NetconfConnector), params.clone()))
            }
            ConnectionKind::Delegated { socket_path } => {
                Box::new(DelegatedBackend::new(socket_path.clone(), params.clone()))
            }
        };
        Self::with_backend(params, backend)
    }

    /// Local manager opening transports through `connector`.
    pub fn with_connector(params: ConnectionParams, connector: Arc<dyn Connector>) -> Self {
        let backend = Box::new(DirectBackend::new(connector, params.clone()));
        Self::with_backend(params, backend)
    }

    pub fn with_backend(params: ConnectionParams, backend: Box<dyn SessionBackend>) -> Self {
        Self {
            label: format!("[{}]", params.host),
            params,
            backend,
            config_state: ConfigSessionState::Closed,
            recorder: None,
        }
    }

    /// Resolve caller options into a manager.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, DeviceError> {
        Ok(Self::new(options.resolve()?))
    }

    /// Resolve options, install the log sink for the host and build a manager.
    pub fn start(options: &ConnectionOptions, log: &LogSettings) -> Result<Self, DeviceError> {
        let params = options.resolve()?;
        logging::init(log, &params.host)?;
        debug!("[{}] Creating device parameters: {:?}", params.host, params);
        Ok(Self::new(params))
    }

    /// Attach a recorder. Clones of the recorder observe the same events.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn recorder(&self) -> Option<&SessionRecorder> {
        self.recorder.as_ref()
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn host(&self) -> &str {
        &self.params.host
    }

    pub fn is_delegated(&self) -> bool {
        self.backend.kind() == crate::backend::BackendKind::Delegated
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Default RPC timeout of the live connection.
    pub fn timeout(&self) -> Duration {
        self.backend.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.backend.set_timeout(timeout);
    }

    pub(super) fn record(&self, event: SessionEvent) {
        if let Some(recorder) = &self.recorder
            && let Err(e) = recorder.record_event(event)
        {
            warn!("{} failed to record session event: {}", self.label, e);
        }
    }

    /// Forget a configuration session whose connection has gone away.
    ///
    /// Locks and private databases belong to the NETCONF session that took
    /// them, so nothing of them survives a reconnect.
    pub(super) fn forget_stale_config(&mut self) {
        if self.config_state != ConfigSessionState::Closed && !self.backend.is_open() {
            debug!(
                "{} Connection lost, configuration session {:?} is gone.",
                self.label, self.config_state
            );
            self.config_state = ConfigSessionState::Closed;
        }
    }

    /// Open the connection. A no-op when it is already open.
    ///
    /// A configuration session left over from a dropped connection is
    /// forgotten before reconnecting.
    pub async fn open(&mut self) -> Result<(), DeviceError> {
        if self.backend.is_open() {
            return Ok(());
        }
        self.forget_stale_config();
        debug!("{} Opening device.", self.label);
        if let Err(e) = self.backend.open().await {
            let message = format!("Unable to make a connection: {e}");
            self.record(SessionEvent::ConnectionFailed {
                host: self.params.host.clone(),
                message: message.clone(),
            });
            return Err(DeviceError::Connection(message));
        }
        self.backend.set_timeout(self.params.timeout);
        debug!(
            "{} Device opened. Default RPC timeout is {:?}.",
            self.label, self.params.timeout
        );
        self.record(SessionEvent::ConnectionOpened {
            host: self.params.host.clone(),
            delegated: self.is_delegated(),
        });
        Ok(())
    }

    /// Close the connection.
    ///
    /// The backend drops its handle before tearing the session down, so the
    /// manager is closed afterwards even when teardown fails. Teardown errors
    /// are logged and swallowed unless `raise_on_error` is set.
    pub async fn close(&mut self, raise_on_error: bool) -> Result<(), DeviceError> {
        debug!("{} Closing device.", self.label);
        let result = self.backend.close().await;
        if self.config_state != ConfigSessionState::Closed {
            debug!(
                "{} Configuration session dropped with the connection.",
                self.label
            );
            self.config_state = ConfigSessionState::Closed;
        }
        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(e) => e.to_string(),
        };
        self.record(SessionEvent::ConnectionClosed { reason });
        match result {
            Ok(()) => {
                debug!("{} Device closed.", self.label);
                Ok(())
            }
            Err(e) if raise_on_error => Err(e),
            Err(e) => {
                debug!("{} Ignoring error while closing the device: {}", self.label, e);
                Ok(())
            }
        }
    }

    /// Release everything this manager holds: the configuration session,
    /// then the connection. Cleanup errors are logged, never returned.
    pub async fn terminate(&mut self) {
        if let Err(e) = self.close_configuration().await {
            warn!("{} {}", self.label, e);
        }
        if let Err(e) = self.close(false).await {
            warn!("{} {}", self.label, e);
        }
    }

    /// Run the release path and hand `result` back unchanged.
    pub async fn finish<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(e) = &result {
            debug!("{} Terminating after failure: {}", self.label, e);
        }
        self.terminate().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedDevice;

    fn manager(device: &ScriptedDevice) -> ConnectionManager {
        ConnectionManager::with_connector(
            ConnectionParams::new("r1", "admin"),
            Arc::new(device.clone()),
        )
    }

    #[tokio::test]
    async fn connection_failure_is_reported_and_leaves_manager_closed() {
        let device = ScriptedDevice::new().fail_connect("authentication failed");
        let mut mgr = manager(&device);
        let err = mgr.open().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to make a connection: authentication failed"
        );
        assert!(!mgr.is_open());
    }

    #[tokio::test]
    async fn open_is_idempotent_and_applies_timeout() {
        let device = ScriptedDevice::new();
        let params =
            ConnectionParams::new("r1", "admin").with_timeout(Duration::from_secs(90));
        let mut mgr = ConnectionManager::with_connector(params, Arc::new(device.clone()));
        mgr.open().await.unwrap();
        mgr.open().await.unwrap();
        assert_eq!(device.connect_count(), 1);
        assert_eq!(mgr.timeout(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn close_errors_are_swallowed_unless_requested() {
        let device = ScriptedDevice::new().on(
            "close-session",
            crate::transport::ScriptedReply::Error("socket reset".into()),
        );
        let mut mgr = manager(&device);
        mgr.open().await.unwrap();
        mgr.close(false).await.unwrap();
        assert!(!mgr.is_open());

        mgr.open().await.unwrap();
        let err = mgr.close(true).await.unwrap_err();
        assert_eq!(err.to_string(), "socket reset");
        assert!(!mgr.is_open());
    }

    #[tokio::test]
    async fn reconnect_does_not_inherit_the_lock() {
        let device = ScriptedDevice::new().on(
            "get-chassis-inventory",
            crate::transport::ScriptedReply::Closed,
        );
        let mut mgr = manager(&device);
        mgr.open_configuration(&ConfigRequest::new(ConfigMode::Exclusive))
            .await
            .unwrap();
        let request = RpcRequest::new("get-chassis-inventory");
        mgr.execute_rpc(&request).await.unwrap_err();
        assert!(!mgr.is_open());

        mgr.execute_rpc(&RpcRequest::new("get-software-information"))
            .await
            .unwrap();
        assert_eq!(device.connect_count(), 2);
        assert_eq!(mgr.config_state(), ConfigSessionState::Closed);

        let load = LoadRequest::lines(LoadAction::Merge, ["set system host-name r1"]);
        assert!(matches!(
            mgr.load_configuration(&load).await,
            Err(DeviceError::NotOpen)
        ));
        mgr.terminate().await;
        assert_eq!(device.count("lock-configuration"), 1);
        assert_eq!(device.count("unlock-configuration"), 0);
    }

    #[tokio::test]
    async fn finish_returns_the_original_error() {
        let device = ScriptedDevice::new();
        let mut mgr = manager(&device);
        mgr.open().await.unwrap();
        let result: Result<(), DeviceError> =
            Err(DeviceError::Validation("bad input".into()));
        let err = mgr.finish(result).await.unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        assert!(!mgr.is_open());
    }
}
