use super::*;
use crate::backend::BackendKind;

/// How a reboot request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RebootOutcome {
    /// The device accepted the request or dropped the session doing so.
    Acknowledged,
    Failed,
    /// The request timed out and the connection was already gone.
    ConnectionAlreadyClosed,
}

impl RebootOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootOutcome::Acknowledged => "acknowledged",
            RebootOutcome::Failed => "failed",
            RebootOutcome::ConnectionAlreadyClosed => "connection_already_closed",
        }
    }
}

impl fmt::Display for RebootOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RebootResult {
    pub outcome: RebootOutcome,
    pub msg: String,
}

impl RebootResult {
    fn new(outcome: RebootOutcome, msg: impl Into<String>) -> Self {
        Self {
            outcome,
            msg: msg.into(),
        }
    }

    pub fn failed(&self) -> bool {
        self.outcome == RebootOutcome::Failed
    }

    pub fn changed(&self) -> bool {
        !self.failed()
    }
}

/// Decides whether an error raised by a reboot RPC is the device going away.
pub trait DisconnectClassifier: Send + Sync {
    fn is_expected_disconnect(&self, error: &DeviceError, backend: BackendKind) -> bool;
}

/// A dropped session always counts. Through a broker the drop surfaces as a
/// connection error, so that counts as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDisconnectClassifier;

impl DisconnectClassifier for DefaultDisconnectClassifier {
    fn is_expected_disconnect(&self, error: &DeviceError, backend: BackendKind) -> bool {
        match error {
            DeviceError::SessionClosed(_) => true,
            DeviceError::Connection(_) => backend == BackendKind::Delegated,
            _ => false,
        }
    }
}

impl ConnectionManager {
    /// Request a reboot with the default disconnect classification.
    pub async fn reboot(&mut self, request: &RebootRequest) -> Result<RebootResult, DeviceError> {
        self.reboot_with(request, &DefaultDisconnectClassifier).await
    }

    /// Request a reboot.
    ///
    /// The RPC runs with a short timeout since a device that reboots
    /// immediately may never answer. Only connection setup errors are
    /// returned; every other failure is reported in the result.
    pub async fn reboot_with(
        &mut self,
        request: &RebootRequest,
        classifier: &dyn DisconnectClassifier,
    ) -> Result<RebootResult, DeviceError> {
        self.open().await?;
        debug!("{} Rebooting device: {:?}", self.label, request);
        let saved = self.backend.timeout();
        self.backend.set_timeout(config::REBOOT_RPC_TIMEOUT);
        let reply = self.backend.reboot(request).await;
        self.backend.set_timeout(saved);

        let result = match reply {
            Ok(reply) => match junos::reboot_status(&reply) {
                Some(status) => RebootResult::new(
                    RebootOutcome::Acknowledged,
                    format!("Reboot successfully initiated. Reboot message: {status}"),
                ),
                None => RebootResult::new(
                    RebootOutcome::Failed,
                    "Did not find expected response from reboot RPC.",
                ),
            },
            Err(DeviceError::RpcTimeout(e)) => {
                debug!("{} Reboot RPC timed out: {}", self.label, e);
                self.classify_timeout().await
            }
            Err(e) if classifier.is_expected_disconnect(&e, self.backend.kind()) => {
                debug!("{} Device dropped the session while rebooting: {}", self.label, e);
                if let Err(close_err) = self.close(false).await {
                    debug!("{} {}", self.label, close_err);
                }
                RebootResult::new(RebootOutcome::Acknowledged, "Reboot succeeded.")
            }
            Err(e) => RebootResult::new(RebootOutcome::Failed, format!("Reboot failed. Error: {e}")),
        };

        self.record(SessionEvent::RebootRequested {
            outcome: result.outcome.to_string(),
            message: result.msg.clone(),
        });
        Ok(result)
    }

    /// A timed out reboot RPC is ambiguous. A session that still closes
    /// cleanly means the device is up and the reboot did not start.
    async fn classify_timeout(&mut self) -> RebootResult {
        if !self.backend.is_open() {
            return RebootResult::new(
                RebootOutcome::ConnectionAlreadyClosed,
                "Reboot succeeded. The connection was already closed.",
            );
        }
        match self.close(true).await {
            Ok(()) => RebootResult::new(
                RebootOutcome::Failed,
                "Reboot failed. It may not have been initiated.",
            ),
            Err(e) => {
                debug!("{} Close after reboot failed: {}", self.label, e);
                RebootResult::new(RebootOutcome::Acknowledged, "Reboot succeeded.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedDevice, ScriptedReply};

    fn manager(device: &ScriptedDevice) -> ConnectionManager {
        ConnectionManager::with_connector(
            ConnectionParams::new("r1", "admin"),
            Arc::new(device.clone()),
        )
    }

    #[tokio::test]
    async fn status_text_means_initiated() {
        let device = ScriptedDevice::new().on(
            "request-reboot",
            "<request-reboot-results><request-reboot-status>Shutdown NOW!</request-reboot-status></request-reboot-results>",
        );
        let mut mgr = manager(&device);
        let result = mgr.reboot(&RebootRequest::default()).await.unwrap();
        assert_eq!(result.outcome, RebootOutcome::Acknowledged);
        assert_eq!(
            result.msg,
            "Reboot successfully initiated. Reboot message: Shutdown NOW!"
        );
        assert_eq!(mgr.timeout(), mgr.params().timeout);
    }

    #[tokio::test]
    async fn missing_status_is_a_failure() {
        let device = ScriptedDevice::new().on("request-reboot", "<ok/>");
        let mut mgr = manager(&device);
        let result = mgr.reboot(&RebootRequest::default()).await.unwrap();
        assert!(result.failed());
        assert_eq!(result.msg, "Did not find expected response from reboot RPC.");
    }

    #[tokio::test]
    async fn dropped_session_counts_as_success() {
        let device = ScriptedDevice::new().on("request-reboot", ScriptedReply::Closed);
        let mut mgr = manager(&device);
        let result = mgr.reboot(&RebootRequest::default()).await.unwrap();
        assert_eq!(result.outcome, RebootOutcome::Acknowledged);
        assert!(!mgr.is_open());
    }

    #[tokio::test]
    async fn timeout_with_a_healthy_session_is_a_failure() {
        let device = ScriptedDevice::new().on("request-reboot", ScriptedReply::Timeout);
        let mut mgr = manager(&device);
        let result = mgr.reboot(&RebootRequest::default()).await.unwrap();
        assert!(result.failed());
        assert_eq!(result.msg, "Reboot failed. It may not have been initiated.");
    }

    #[tokio::test]
    async fn timeout_with_a_broken_close_is_a_success() {
        let device = ScriptedDevice::new()
            .on("request-reboot", ScriptedReply::Timeout)
            .on("close-session", ScriptedReply::Error("broken pipe".into()));
        let mut mgr = manager(&device);
        let result = mgr.reboot(&RebootRequest::default()).await.unwrap();
        assert_eq!(result.outcome, RebootOutcome::Acknowledged);
        assert_eq!(result.msg, "Reboot succeeded.");
    }

    #[test]
    fn default_classifier() {
        let classifier = DefaultDisconnectClassifier;
        let refused = DeviceError::Connection("refused".into());
        assert!(!classifier.is_expected_disconnect(&refused, BackendKind::Direct));
        assert!(classifier.is_expected_disconnect(&refused, BackendKind::Delegated));
        assert!(classifier.is_expected_disconnect(
            &DeviceError::SessionClosed("eof".into()),
            BackendKind::Direct
        ));
        assert!(!classifier.is_expected_disconnect(
            &DeviceError::rpc("permission denied"),
            BackendKind::Direct
        ));
    }
}
