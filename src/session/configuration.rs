use super::*;

/// Lifecycle of the configuration database session on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSessionState {
    #[default]
    Closed,
    Opening,
    Open(ConfigMode),
    Closing,
}

/// How to open the configuration database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigRequest {
    pub mode: ConfigMode,
    #[serde(default)]
    pub ephemeral_instance: Option<String>,
    #[serde(default)]
    pub ignore_warning: Option<IgnoreWarning>,
}

impl ConfigRequest {
    pub fn new(mode: ConfigMode) -> Self {
        Self {
            mode,
            ephemeral_instance: None,
            ignore_warning: None,
        }
    }

    /// Build a request from raw option values.
    pub fn parse(mode: &str, ephemeral_instance: Option<&str>) -> Result<Self, DeviceError> {
        let request = Self {
            mode: mode.parse()?,
            ephemeral_instance: ephemeral_instance.map(str::to_string),
            ignore_warning: None,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_ephemeral_instance(mut self, instance: impl Into<String>) -> Self {
        self.ephemeral_instance = Some(instance.into());
        self
    }

    pub fn with_ignore_warning(mut self, ignore_warning: IgnoreWarning) -> Self {
        self.ignore_warning = Some(ignore_warning);
        self
    }

    pub(super) fn validate(&self) -> Result<(), DeviceError> {
        if self.ephemeral_instance.is_some() && self.mode != ConfigMode::Ephemeral {
            return Err(DeviceError::ConfigurationLock(
                "Ephemeral instance is specified while the mode is not ephemeral.Specify the mode as ephemeral or do not specify the instance."
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Where configuration to load comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// Inline configuration lines.
    Lines(Vec<String>),
    /// Local file.
    File(PathBuf),
    /// Jinja2 template rendered with `vars`.
    Template { path: PathBuf, vars: Value },
    /// URL the device fetches itself.
    Url(String),
}

/// A configuration load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadRequest {
    pub action: LoadAction,
    pub source: LoadSource,
    /// Overrides format detection.
    #[serde(default)]
    pub format: Option<ConfigFormat>,
    #[serde(default)]
    pub ignore_warning: Option<IgnoreWarning>,
}

const SET_VERBS: &[&str] = &[
    "set",
    "delete",
    "activate",
    "deactivate",
    "annotate",
    "copy",
    "insert",
    "protect",
    "rename",
    "unprotect",
    "edit",
    "top",
    "up",
    "wildcard",
];

fn format_from_path(path: &Path) -> Option<ConfigFormat> {
    let name = path.to_string_lossy();
    let name = name.strip_suffix(".j2").unwrap_or(&name);
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "conf" | "text" | "txt" => Some(ConfigFormat::Text),
        "set" => Some(ConfigFormat::Set),
        "xml" => Some(ConfigFormat::Xml),
        "json" => Some(ConfigFormat::Json),
        _ => None,
    }
}

fn format_from_content(content: &str) -> ConfigFormat {
    let trimmed = content.trim_start();
    if trimmed.starts_with('<') {
        return ConfigFormat::Xml;
    }
    if trimmed.starts_with('{') {
        return ConfigFormat::Json;
    }
    let first_word = trimmed.split_whitespace().next().unwrap_or_default();
    if SET_VERBS.contains(&first_word) {
        ConfigFormat::Set
    } else {
        ConfigFormat::Text
    }
}

fn read_source(path: &Path) -> Result<String, DeviceError> {
    std::fs::read_to_string(path).map_err(|e| {
        DeviceError::Validation(format!(
            "Unable to read the configuration file {}. {e}",
            path.display()
        ))
    })
}

impl LoadRequest {
    pub fn new(action: LoadAction, source: LoadSource) -> Self {
        Self {
            action,
            source,
            format: None,
            ignore_warning: None,
        }
    }

    pub fn lines<I, S>(action: LoadAction, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            action,
            LoadSource::Lines(lines.into_iter().map(Into::into).collect()),
        )
    }

    pub fn with_format(mut self, format: ConfigFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_ignore_warning(mut self, ignore_warning: IgnoreWarning) -> Self {
        self.ignore_warning = Some(ignore_warning);
        self
    }

    /// Read, render and classify the source without touching the device.
    pub fn resolve(&self) -> Result<LoadPayload, DeviceError> {
        let (content, detected) = match &self.source {
            LoadSource::Lines(lines) => {
                let text = lines
                    .iter()
                    .map(|line| line.trim_end_matches('\n'))
                    .collect::<Vec<_>>()
                    .join("\n");
                let format = format_from_content(&text);
                (LoadContent::Text(text), format)
            }
            LoadSource::File(path) => {
                let text = read_source(path)?;
                let format = format_from_path(path).unwrap_or_else(|| format_from_content(&text));
                (LoadContent::Text(text), format)
            }
            LoadSource::Template { path, vars } => {
                let source = read_source(path)?;
                let env = minijinja::Environment::new();
                let text = env.render_str(&source, vars)?;
                let format = format_from_path(path).unwrap_or_else(|| format_from_content(&text));
                (LoadContent::Text(text), format)
            }
            LoadSource::Url(url) => (
                LoadContent::Url(url.clone()),
                format_from_path(Path::new(url)).unwrap_or(ConfigFormat::Text),
            ),
        };
        let format = match self.action {
            LoadAction::Set => ConfigFormat::Set,
            _ => self.format.unwrap_or(detected),
        };
        Ok(LoadPayload {
            action: self.action,
            format,
            content,
            ignore_warning: WarningFilter::from_option(self.ignore_warning.as_ref()),
        })
    }
}

/// Commit options. `timeout` defaults to the connection RPC timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommitOptions {
    #[serde(default)]
    pub ignore_warning: Option<IgnoreWarning>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Minutes before an unconfirmed commit is rolled back.
    #[serde(default)]
    pub confirmed: Option<u32>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub force_sync: bool,
}

/// Retrieved configuration: the text form and its structured form.
///
/// `parsed` holds the lines for `set`, the element tree for `xml`, the
/// value for `json` and nothing for `text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigOutput {
    pub format: ConfigFormat,
    pub text: String,
    pub parsed: Option<Value>,
}

fn describe_body(body: &ReplyBody) -> String {
    match body {
        ReplyBody::Ok => "<ok/>".to_string(),
        ReplyBody::Element(el) => el.to_xml(),
        ReplyBody::Json(value) => value.to_string(),
        ReplyBody::Text(text) => text.clone(),
    }
}

/// Turn a configuration reply into [`ConfigOutput`], checking its shape.
pub(super) fn config_output(fetch: &ConfigFetch, reply: RpcReply) -> Result<ConfigOutput, DeviceError> {
    let unexpected_type = |body: &ReplyBody| {
        DeviceError::rpc(format!(
            "Unexpected configuration type returned. Configuration is: {}",
            describe_body(body)
        ))
    };
    let format = fetch.format;
    match (format, reply.body) {
        (ConfigFormat::Json, ReplyBody::Json(value)) => Ok(ConfigOutput {
            format,
            text: serde_json::to_string(&value)?,
            parsed: Some(value),
        }),
        (ConfigFormat::Json, body) => Err(unexpected_type(&body)),
        (_, ReplyBody::Element(el)) => {
            if fetch.model.is_none()
                && let Some(tag) = junos::expected_config_tag(format)
                && el.local_name() != tag
            {
                return Err(DeviceError::rpc(format!(
                    "Unexpected XML tag returned. Configuration is: {}",
                    el.to_xml()
                )));
            }
            Ok(match format {
                ConfigFormat::Xml => ConfigOutput {
                    format,
                    text: el.to_pretty(),
                    parsed: Some(el.to_value()),
                },
                ConfigFormat::Set => {
                    let text = el.text();
                    let lines = text.lines().map(|l| Value::String(l.to_string())).collect();
                    ConfigOutput {
                        format,
                        text,
                        parsed: Some(Value::Array(lines)),
                    }
                }
                _ => ConfigOutput {
                    format,
                    text: el.text(),
                    parsed: None,
                },
            })
        }
        (_, body) => Err(unexpected_type(&body)),
    }
}

impl ConnectionManager {
    /// Current configuration session state.
    pub fn config_state(&self) -> ConfigSessionState {
        self.config_state
    }

    /// Mode of the open configuration session.
    pub fn config_mode(&self) -> Option<ConfigMode> {
        match self.config_state {
            ConfigSessionState::Open(mode) => Some(mode),
            _ => None,
        }
    }

    fn require_config(&self) -> Result<ConfigMode, DeviceError> {
        match self.config_state {
            ConfigSessionState::Open(mode) if self.backend.is_open() => Ok(mode),
            _ => Err(DeviceError::NotOpen),
        }
    }

    fn record_change<T>(&self, operation: &str, result: &Result<T, DeviceError>) {
        self.record(SessionEvent::ConfigurationChanged {
            operation: operation.to_string(),
            success: result.is_ok(),
            message: result.as_ref().err().map(|e| e.to_string()),
        });
    }

    /// Open the configuration database. A no-op when a session is already
    /// open, whatever its mode. Opens the connection if needed.
    pub async fn open_configuration(&mut self, request: &ConfigRequest) -> Result<(), DeviceError> {
        self.forget_stale_config();
        if let ConfigSessionState::Open(mode) = self.config_state {
            debug!(
                "{} Configuration already open in {} mode.",
                self.label, mode
            );
            return Ok(());
        }
        request.validate()?;
        self.open().await?;

        let mode = request.mode;
        let filter = WarningFilter::with_builtin(request.ignore_warning.as_ref());
        debug!("{} Opening the configuration in {} mode.", self.label, mode);
        self.config_state = ConfigSessionState::Opening;
        let result = self
            .backend
            .open_configuration(mode, request.ephemeral_instance.as_deref(), &filter)
            .await;
        match result {
            Ok(()) => {
                self.config_state = ConfigSessionState::Open(mode);
                self.record(SessionEvent::ConfigurationOpened {
                    mode,
                    ephemeral_instance: request.ephemeral_instance.clone(),
                });
                debug!("{} Configuration opened in {} mode.", self.label, mode);
                Ok(())
            }
            Err(e) => {
                self.config_state = ConfigSessionState::Closed;
                Err(DeviceError::ConfigurationLock(format!(
                    "Unable to open the configuration in {mode} mode: {e}"
                )))
            }
        }
    }

    /// Close the configuration session. A no-op when none is open.
    ///
    /// The session is forgotten before the device is asked to release it,
    /// so a failure here never leaves a session that would be closed twice.
    pub async fn close_configuration(&mut self) -> Result<(), DeviceError> {
        self.forget_stale_config();
        let ConfigSessionState::Open(mode) = self.config_state else {
            self.config_state = ConfigSessionState::Closed;
            return Ok(());
        };
        self.config_state = ConfigSessionState::Closing;
        debug!("{} Closing the configuration.", self.label);
        let result = self.backend.close_configuration(mode).await;
        self.config_state = ConfigSessionState::Closed;
        self.record(SessionEvent::ConfigurationClosed {
            mode,
            success: result.is_ok(),
        });
        result.map_err(|e| {
            DeviceError::Configuration(format!("Unable to close the configuration: {e}"))
        })?;
        debug!("{} Configuration closed.", self.label);
        Ok(())
    }

    /// Retrieve configuration from the committed or candidate database.
    pub async fn get_configuration(&mut self, fetch: &ConfigFetch) -> Result<ConfigOutput, DeviceError> {
        self.open().await?;
        debug!(
            "{} Retrieving the {} configuration in {} format.",
            self.label, fetch.database, fetch.format
        );
        let reply = self
            .backend
            .get_configuration(fetch)
            .await
            .map_err(|e| DeviceError::rpc(format!("Unable to retrieve the configuration: {e}")))?;
        config_output(fetch, reply)
    }

    /// Load configuration into the candidate database.
    pub async fn load_configuration(&mut self, request: &LoadRequest) -> Result<(), DeviceError> {
        self.require_config()?;
        let payload = request.resolve()?;
        debug!(
            "{} Loading the configuration ({} action, {} format).",
            self.label, payload.action, payload.format
        );
        let result = self
            .backend
            .load_configuration(&payload)
            .await
            .map_err(|e| {
                DeviceError::Configuration(format!("Failure loading the configuration: {e}"))
            });
        self.record_change("load", &result);
        result?;
        debug!("{} Configuration loaded.", self.label);
        Ok(())
    }

    /// Validate the candidate configuration (`commit check`).
    pub async fn check_configuration(&mut self) -> Result<(), DeviceError> {
        self.require_config()?;
        debug!("{} Checking the configuration.", self.label);
        let result = self.backend.check_configuration().await.map_err(|e| {
            DeviceError::Configuration(format!("Failure checking the configuration: {e}"))
        });
        self.record_change("check", &result);
        result?;
        debug!("{} Configuration checked.", self.label);
        Ok(())
    }

    /// Candidate against the active configuration. `None` when identical.
    pub async fn diff_configuration(
        &mut self,
        ignore_warning: Option<&IgnoreWarning>,
    ) -> Result<Option<String>, DeviceError> {
        self.require_config()?;
        debug!("{} Diffing candidate and committed configurations.", self.label);
        let filter = WarningFilter::from_option(ignore_warning);
        let result = self.backend.diff_configuration(&filter).await.map_err(|e| {
            DeviceError::Configuration(format!("Failure diffing the configuration: {e}"))
        });
        self.record_change("diff", &result);
        let diff = result?;
        debug!("{} Configuration diff completed.", self.label);
        Ok(diff)
    }

    /// Commit the candidate configuration.
    pub async fn commit_configuration(&mut self, options: &CommitOptions) -> Result<(), DeviceError> {
        self.require_config()?;
        let payload = CommitPayload {
            comment: options.comment.clone(),
            confirmed: options.confirmed,
            timeout: options.timeout.unwrap_or_else(|| self.backend.timeout()),
            full: options.full,
            sync: options.sync,
            force_sync: options.force_sync,
            ignore_warning: WarningFilter::from_option(options.ignore_warning.as_ref()),
        };
        debug!(
            "{} Committing the configuration (timeout {:?}).",
            self.label, payload.timeout
        );
        let result = self
            .backend
            .commit_configuration(&payload)
            .await
            .map_err(|e| {
                DeviceError::Configuration(format!("Failure committing the configuration: {e}"))
            });
        self.record_change("commit", &result);
        result?;
        debug!("{} Configuration committed.", self.label);
        Ok(())
    }

    /// Replace the candidate with the rescue or a numbered rollback configuration.
    pub async fn rollback_configuration(&mut self, id: RollbackId) -> Result<(), DeviceError> {
        self.require_config()?;
        debug!("{} Loading the {} configuration.", self.label, describe_rollback(id));
        let result = self.backend.rollback_configuration(id).await.map_err(|e| {
            DeviceError::Configuration(format!(
                "Unable to load the {} configuration: {e}",
                describe_rollback(id)
            ))
        });
        self.record_change("rollback", &result);
        result
    }
}

fn describe_rollback(id: RollbackId) -> String {
    match id {
        RollbackId::Rescue => "rescue".to_string(),
        RollbackId::Numbered(n) => format!("rollback {n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn set_action_forces_set_format() {
        let request = LoadRequest::lines(LoadAction::Set, ["interfaces { ge-0/0/0 { disable; } }"])
            .with_format(ConfigFormat::Text);
        assert_eq!(request.resolve().unwrap().format, ConfigFormat::Set);
    }

    #[test]
    fn lines_are_joined_after_trimming_trailing_newlines() {
        let request = LoadRequest::lines(
            LoadAction::Merge,
            ["set system host-name r1\n", "set system ntp server 10.0.0.1\n\n"],
        );
        let payload = request.resolve().unwrap();
        assert_eq!(
            payload.content,
            LoadContent::Text(
                "set system host-name r1\nset system ntp server 10.0.0.1".to_string()
            )
        );
        assert_eq!(payload.format, ConfigFormat::Set);
    }

    #[test]
    fn content_sniffing_recognizes_each_format() {
        assert_eq!(format_from_content("  <configuration/>"), ConfigFormat::Xml);
        assert_eq!(format_from_content("{\"configuration\": {}}"), ConfigFormat::Json);
        assert_eq!(format_from_content("delete interfaces ge-0/0/1"), ConfigFormat::Set);
        assert_eq!(format_from_content("system { host-name r1; }"), ConfigFormat::Text);
    }

    #[test]
    fn file_extension_wins_over_content() {
        assert_eq!(
            format_from_path(Path::new("/tmp/base.conf")),
            Some(ConfigFormat::Text)
        );
        assert_eq!(
            format_from_path(Path::new("/tmp/base.set.j2")),
            Some(ConfigFormat::Set)
        );
        assert_eq!(format_from_path(Path::new("/tmp/base")), None);
    }

    #[test]
    fn template_is_rendered_with_vars() {
        let mut file = tempfile::Builder::new().suffix(".set.j2").tempfile().unwrap();
        write!(
            file,
            "{{% for name in interfaces %}}set interfaces {{{{ name }}}} disable\n{{% endfor %}}"
        )
        .unwrap();
        let request = LoadRequest::new(
            LoadAction::Merge,
            LoadSource::Template {
                path: file.path().to_path_buf(),
                vars: serde_json::json!({"interfaces": ["ge-0/0/0", "ge-0/0/1"]}),
            },
        );
        let payload = request.resolve().unwrap();
        assert_eq!(payload.format, ConfigFormat::Set);
        assert_eq!(
            payload.content,
            LoadContent::Text(
                "set interfaces ge-0/0/0 disable\nset interfaces ge-0/0/1 disable\n".to_string()
            )
        );
    }

    #[test]
    fn missing_file_is_a_validation_error() {
        let request = LoadRequest::new(
            LoadAction::Merge,
            LoadSource::File(PathBuf::from("/nonexistent/r1.conf")),
        );
        assert!(matches!(
            request.resolve().unwrap_err(),
            DeviceError::Validation(_)
        ));
    }

    #[test]
    fn instance_requires_ephemeral_mode() {
        let err = ConfigRequest::parse("private", Some("eph1")).unwrap_err();
        assert!(err.to_string().starts_with("Ephemeral instance is specified"));
        assert!(ConfigRequest::parse("ephemeral", Some("eph1")).is_ok());
        assert_eq!(
            ConfigRequest::parse("shared", None).unwrap_err().to_string(),
            "Invalid configuration mode: shared"
        );
    }

    #[test]
    fn config_output_checks_the_top_level_tag() {
        let fetch = ConfigFetch {
            format: ConfigFormat::Text,
            ..Default::default()
        };
        let reply = RpcReply {
            body: ReplyBody::Element(Element::new("configuration").with_text("x")),
            warnings: vec![],
        };
        let err = config_output(&fetch, reply.clone()).unwrap_err();
        assert!(err.to_string().starts_with("Unexpected XML tag returned."));

        let fetch = ConfigFetch {
            format: ConfigFormat::Text,
            model: Some("openconfig".into()),
            ..Default::default()
        };
        assert_eq!(config_output(&fetch, reply).unwrap().text, "x");
    }

    #[test]
    fn set_output_is_split_into_lines() {
        let fetch = ConfigFetch {
            format: ConfigFormat::Set,
            ..Default::default()
        };
        let reply = RpcReply {
            body: ReplyBody::Element(
                Element::new("configuration-set").with_text("set a\nset b"),
            ),
            warnings: vec![],
        };
        let output = config_output(&fetch, reply).unwrap();
        assert_eq!(output.parsed, Some(serde_json::json!(["set a", "set b"])));
    }

    #[test]
    fn json_format_rejects_xml_bodies() {
        let fetch = ConfigFetch {
            format: ConfigFormat::Json,
            ..Default::default()
        };
        let reply = RpcReply {
            body: ReplyBody::Element(Element::new("configuration")),
            warnings: vec![],
        };
        let err = config_output(&fetch, reply).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Unexpected configuration type returned."));
    }
}
