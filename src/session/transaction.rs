use super::*;

/// Stage of a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStage {
    Open,
    Load,
    Check,
    Diff,
    Commit,
    Close,
}

impl fmt::Display for ChangeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeStage::Open => "open",
            ChangeStage::Load => "load",
            ChangeStage::Check => "check",
            ChangeStage::Diff => "diff",
            ChangeStage::Commit => "commit",
            ChangeStage::Close => "close",
        };
        f.write_str(name)
    }
}

fn default_check() -> bool {
    true
}

/// A configuration change applied as one unit.
///
/// The configuration session is opened, every load is applied in order,
/// the candidate is checked and diffed, and it is committed only when
/// `commit` is set and the diff is not empty. The session is closed on
/// every path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigChange {
    /// Logical name used in logs and recordings.
    pub name: String,
    pub config: ConfigRequest,
    pub loads: Vec<LoadRequest>,
    /// Run `commit check` before diffing.
    #[serde(default = "default_check")]
    pub check: bool,
    /// Commit options. `None` stops after the diff, leaving the
    /// candidate to be discarded when the session closes.
    #[serde(default)]
    pub commit: Option<CommitOptions>,
}

/// Outcome of a [`ConfigChange`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigChangeSummary {
    pub name: String,
    /// The candidate differed from the active configuration.
    pub changed: bool,
    pub committed: bool,
    pub diff: Option<String>,
    /// Where the diff was saved.
    pub diff_file: Option<PathBuf>,
    /// Stage that failed, if any.
    pub failed_stage: Option<ChangeStage>,
    pub failure_reason: Option<String>,
    /// Error raised while closing the session after a failure.
    pub close_error: Option<String>,
}

impl ConfigChangeSummary {
    pub fn failed(&self) -> bool {
        self.failed_stage.is_some()
    }
}

impl ConfigChange {
    pub fn new(name: impl Into<String>, config: ConfigRequest) -> Self {
        Self {
            name: name.into(),
            config,
            loads: Vec::new(),
            check: true,
            commit: None,
        }
    }

    pub fn with_load(mut self, load: LoadRequest) -> Self {
        self.loads.push(load);
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn with_commit(mut self, options: CommitOptions) -> Self {
        self.commit = Some(options);
        self
    }

    /// Validate the change before contacting the device.
    ///
    /// Every load source is resolved so unreadable files and broken
    /// templates are reported up front.
    pub fn validate(&self) -> Result<Vec<LoadPayload>, DeviceError> {
        if self.name.trim().is_empty() {
            return Err(DeviceError::Validation(
                "configuration change has no name".to_string(),
            ));
        }
        if self.loads.is_empty() && self.commit.is_some() {
            return Err(DeviceError::Validation(format!(
                "configuration change {} commits without loading anything",
                self.name
            )));
        }
        self.config.validate()?;
        self.loads.iter().map(LoadRequest::resolve).collect()
    }
}

impl ConnectionManager {
    /// Apply a [`ConfigChange`].
    ///
    /// Validation errors are returned before the device is contacted.
    /// Failures past that point are reported in the summary after the
    /// configuration session has been closed. A non-empty diff is saved
    /// through `sink` when one is given.
    pub async fn apply_change(
        &mut self,
        change: &ConfigChange,
        mut sink: Option<&mut OutputSink>,
    ) -> Result<ConfigChangeSummary, DeviceError> {
        change.validate()?;
        let mut summary = ConfigChangeSummary {
            name: change.name.clone(),
            ..Default::default()
        };
        debug!("{} Applying configuration change {}.", self.label, change.name);

        if let Err((stage, e)) = self.run_change(change, &mut summary, &mut sink).await {
            warn!(
                "{} Configuration change {} failed at {}: {}",
                self.label, change.name, stage, e
            );
            summary.failed_stage = Some(stage);
            summary.failure_reason = Some(e.to_string());
        }

        if let Err(e) = self.close_configuration().await {
            if summary.failed() {
                summary.close_error = Some(e.to_string());
            } else {
                summary.failed_stage = Some(ChangeStage::Close);
                summary.failure_reason = Some(e.to_string());
            }
        }
        debug!(
            "{} Configuration change {} done: changed={}, committed={}.",
            self.label, change.name, summary.changed, summary.committed
        );
        Ok(summary)
    }

    async fn run_change(
        &mut self,
        change: &ConfigChange,
        summary: &mut ConfigChangeSummary,
        sink: &mut Option<&mut OutputSink>,
    ) -> Result<(), (ChangeStage, DeviceError)> {
        let at = |stage: ChangeStage| move |e: DeviceError| (stage, e);

        self.open_configuration(&change.config)
            .await
            .map_err(at(ChangeStage::Open))?;
        for load in &change.loads {
            self.load_configuration(load)
                .await
                .map_err(at(ChangeStage::Load))?;
        }
        if change.check {
            self.check_configuration()
                .await
                .map_err(at(ChangeStage::Check))?;
        }

        let diff = self
            .diff_configuration(change.config.ignore_warning.as_ref())
            .await
            .map_err(at(ChangeStage::Diff))?;
        summary.changed = diff.is_some();
        if let (Some(diff), Some(sink)) = (&diff, sink.as_deref_mut()) {
            summary.diff_file = sink.save_diff(diff).map_err(at(ChangeStage::Diff))?;
        }
        summary.diff = diff;

        match &change.commit {
            Some(options) if summary.changed => {
                self.commit_configuration(options)
                    .await
                    .map_err(at(ChangeStage::Commit))?;
                summary.committed = true;
            }
            Some(_) => debug!("{} No differences found, skipping the commit.", self.label),
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputOptions;
    use crate::transport::{ScriptedDevice, ScriptedReply};

    const DIFF_REPLY: &str = "<configuration-information><configuration-output>\n[edit interfaces ge-0/0/0]\n+   disable;\n</configuration-output></configuration-information>";

    fn manager(device: &ScriptedDevice) -> ConnectionManager {
        ConnectionManager::with_connector(
            ConnectionParams::new("r1", "admin"),
            Arc::new(device.clone()),
        )
    }

    fn disable_ge0() -> ConfigChange {
        ConfigChange::new("disable-ge0", ConfigRequest::new(ConfigMode::Exclusive))
            .with_load(LoadRequest::lines(
                LoadAction::Merge,
                ["set interfaces ge-0/0/0 disable"],
            ))
            .with_commit(CommitOptions::default())
    }

    #[tokio::test]
    async fn commits_when_the_candidate_differs() {
        let device = ScriptedDevice::new().on("get-configuration", DIFF_REPLY);
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::new(
            "r1",
            OutputOptions {
                dest_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        );
        let mut mgr = manager(&device);

        let summary = mgr.apply_change(&disable_ge0(), Some(&mut sink)).await.unwrap();
        assert!(!summary.failed());
        assert!(summary.changed);
        assert!(summary.committed);
        assert_eq!(summary.diff_file, Some(dir.path().join("r1.diff")));
        assert_eq!(
            device.rpc_names(),
            vec![
                "lock-configuration",
                "load-configuration",
                "commit-configuration",
                "get-configuration",
                "commit-configuration",
                "unlock-configuration",
            ]
        );
        assert_eq!(mgr.config_state(), ConfigSessionState::Closed);
    }

    #[tokio::test]
    async fn empty_diff_skips_the_commit() {
        let device = ScriptedDevice::new();
        let mut mgr = manager(&device);
        let summary = mgr.apply_change(&disable_ge0(), None).await.unwrap();
        assert!(!summary.changed);
        assert!(!summary.committed);
        assert_eq!(device.count("commit-configuration"), 1);
    }

    #[tokio::test]
    async fn load_failure_still_closes_the_session() {
        let device = ScriptedDevice::new().on(
            "load-configuration",
            "<load-configuration-results><rpc-error><error-severity>error</error-severity><error-message>syntax error</error-message></rpc-error></load-configuration-results>",
        );
        let mut mgr = manager(&device);
        let summary = mgr.apply_change(&disable_ge0(), None).await.unwrap();
        assert_eq!(summary.failed_stage, Some(ChangeStage::Load));
        assert!(summary
            .failure_reason
            .unwrap()
            .starts_with("Failure loading the configuration"));
        assert_eq!(device.count("unlock-configuration"), 1);
        assert_eq!(mgr.config_state(), ConfigSessionState::Closed);
    }

    #[tokio::test]
    async fn lock_failure_is_reported_without_unlock() {
        let device = ScriptedDevice::new().on("lock-configuration", ScriptedReply::Error("locked by netconf".into()));
        let mut mgr = manager(&device);
        let summary = mgr.apply_change(&disable_ge0(), None).await.unwrap();
        assert_eq!(summary.failed_stage, Some(ChangeStage::Open));
        assert_eq!(device.count("unlock-configuration"), 0);
    }

    #[test]
    fn validation_catches_commit_without_loads() {
        let change = ConfigChange::new("noop", ConfigRequest::new(ConfigMode::Private))
            .with_commit(CommitOptions::default());
        assert!(matches!(change.validate(), Err(DeviceError::Validation(_))));
    }
}
