use super::*;

/// One RPC to execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RpcRequest {
    /// RPC name; underscores are accepted in place of dashes.
    pub name: String,
    #[serde(default)]
    pub kwargs: Option<ArgMap>,
    #[serde(default)]
    pub attrs: Option<ArgMap>,
    #[serde(default)]
    pub format: RpcFormat,
    #[serde(default)]
    pub ignore_warning: Option<IgnoreWarning>,
    /// Configuration filter, only honoured for `get-config`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl RpcRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: RpcFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.kwargs
            .get_or_insert_with(ArgMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.attrs
            .get_or_insert_with(ArgMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Dashed RPC name.
    pub fn rpc_name(&self) -> String {
        self.name.trim().replace('_', "-")
    }

    fn is_get_config(&self) -> bool {
        self.rpc_name() == "get-config"
    }
}

/// Outcome of one RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RpcResult {
    pub rpc: String,
    pub format: RpcFormat,
    pub kwargs: Option<ArgMap>,
    pub attrs: Option<ArgMap>,
    pub msg: String,
    pub failed: bool,
    /// Reply rendered as text.
    pub text: String,
    /// Structured reply. `None` for the text format.
    pub parsed: Option<Value>,
    /// Warnings the ignore filter let through.
    pub warnings: Vec<String>,
    /// File the output was saved to.
    pub dest: Option<PathBuf>,
}

impl RpcResult {
    fn new(request: &RpcRequest) -> Self {
        Self {
            rpc: request.rpc_name(),
            format: request.format,
            kwargs: request.kwargs.clone(),
            attrs: request.attrs.clone(),
            msg: String::new(),
            failed: false,
            text: String::new(),
            parsed: None,
            warnings: Vec::new(),
            dest: None,
        }
    }

    pub fn lines(&self) -> Vec<&str> {
        self.text.lines().collect()
    }
}

/// Several RPCs with per-RPC or broadcast options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RpcBatch {
    pub rpcs: Vec<String>,
    /// One format for every RPC, or one per RPC. Empty means `xml`.
    #[serde(default)]
    pub formats: Vec<RpcFormat>,
    /// One map per RPC.
    #[serde(default)]
    pub kwargs: Option<Vec<ArgMap>>,
    /// One map per RPC.
    #[serde(default)]
    pub attrs: Option<Vec<ArgMap>>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub ignore_warning: Option<IgnoreWarning>,
}

/// Outcome of a batch. Failed only when every RPC failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchResult {
    pub results: Vec<RpcResult>,
    pub failed: bool,
}

impl RpcBatch {
    pub fn new<I, S>(rpcs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rpcs: rpcs.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Check list lengths and expand into one request per RPC.
    pub fn requests(&self) -> Result<Vec<RpcRequest>, DeviceError> {
        let count = self.rpcs.len();
        let formats = match self.formats.len() {
            0 => vec![RpcFormat::default(); count],
            1 => vec![self.formats[0]; count],
            n if n == count => self.formats.clone(),
            n => {
                return Err(DeviceError::Validation(format!(
                    "The formats option must have a single value, or one value per rpc. There are {count} rpcs and {n} formats."
                )));
            }
        };
        let per_rpc = |name: &str, values: &Option<Vec<ArgMap>>| match values {
            Some(values) if values.len() != count => Err(DeviceError::Validation(format!(
                "The {name} option must have one value per rpc. There are {count} rpcs and {} {name}.",
                values.len()
            ))),
            Some(values) => Ok(values.iter().cloned().map(Some).collect::<Vec<_>>()),
            None => Ok(vec![None; count]),
        };
        let kwargs = per_rpc("kwargs", &self.kwargs)?;
        let attrs = per_rpc("attrs", &self.attrs)?;

        if self.filter.is_some()
            && (count != 1 || self.rpcs[0].trim().replace('_', "-") != "get-config")
        {
            return Err(DeviceError::Validation(
                "The filter option is only valid when the rpcs option value is a single 'get-config' RPC."
                    .to_string(),
            ));
        }

        Ok(self
            .rpcs
            .iter()
            .zip(formats)
            .zip(kwargs.into_iter().zip(attrs))
            .map(|((name, format), (kwargs, attrs))| RpcRequest {
                name: name.clone(),
                kwargs,
                attrs,
                format,
                ignore_warning: self.ignore_warning.clone(),
                filter: self.filter.clone(),
            })
            .collect())
    }
}

/// Text of a reply element: its own text, or that of its children.
fn element_text(el: &Element) -> String {
    let direct = el.text();
    if !direct.trim().is_empty() || !el.has_element_children() {
        return direct;
    }
    el.elements().map(element_text).collect::<Vec<_>>().join("\n")
}

/// Render a reply body in the requested format.
fn normalize(format: RpcFormat, body: ReplyBody) -> Result<(String, Option<Value>), DeviceError> {
    match (format, body) {
        (_, ReplyBody::Ok) => Ok((String::new(), None)),
        (RpcFormat::Text, ReplyBody::Element(el)) => Ok((element_text(&el), None)),
        (RpcFormat::Text, ReplyBody::Text(text)) => Ok((text, None)),
        (RpcFormat::Xml, ReplyBody::Element(el)) => Ok((el.to_pretty(), Some(el.to_value()))),
        (RpcFormat::Json, ReplyBody::Json(value)) => Ok((serde_json::to_string(&value)?, Some(value))),
        (format, body) => {
            let observed = match body {
                ReplyBody::Element(el) => el.to_xml(),
                ReplyBody::Json(value) => value.to_string(),
                ReplyBody::Text(text) => text,
                ReplyBody::Ok => String::new(),
            };
            Err(DeviceError::rpc(format!(
                "Unexpected {format} reply content: {observed}"
            )))
        }
    }
}

fn rpc_failure(rpc: &str, error: DeviceError) -> DeviceError {
    let warnings = match &error {
        DeviceError::Rpc { warnings, .. } => warnings.clone(),
        _ => Vec::new(),
    };
    DeviceError::Rpc {
        message: format!("Unable to execute the RPC: {rpc}. Error: {error}"),
        warnings,
    }
}

fn config_format(format: RpcFormat) -> ConfigFormat {
    match format {
        RpcFormat::Text => ConfigFormat::Text,
        RpcFormat::Xml => ConfigFormat::Xml,
        RpcFormat::Json => ConfigFormat::Json,
    }
}

fn get_config_fetch(request: &RpcRequest) -> Result<ConfigFetch, DeviceError> {
    let mut fetch = ConfigFetch {
        format: config_format(request.format),
        options: request.attrs.clone().unwrap_or_default(),
        filter: request.filter.clone(),
        ..Default::default()
    };
    for (key, value) in request.kwargs.iter().flatten() {
        match key.as_str() {
            "database" => fetch.database = value.to_string().parse::<Database>()?,
            "model" => fetch.model = Some(value.to_string()),
            "namespace" => fetch.namespace = Some(value.to_string()),
            "remove_ns" => {
                fetch.remove_ns = match value {
                    ArgValue::Bool(b) => *b,
                    ArgValue::Text(t) => {
                        parse_bool(t).unwrap_or(true)
                    }
                }
            }
            _ => {
                fetch.options.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(fetch)
}

impl ConnectionManager {
    /// Execute one RPC. Opens the connection if needed.
    ///
    /// `get-config` is answered through a configuration fetch: its attrs
    /// become `get-configuration` options and its kwargs select database,
    /// model and namespace.
    pub async fn execute_rpc(&mut self, request: &RpcRequest) -> Result<RpcResult, DeviceError> {
        self.open().await?;
        let mut result = RpcResult::new(request);
        let name = result.rpc.clone();
        debug!("{} Executing RPC {} ({} format).", self.label, name, request.format);

        let outcome = if request.is_get_config() {
            self.run_get_config(request).await
        } else {
            self.run_rpc(request).await
        };
        self.record(SessionEvent::RpcExecuted {
            rpc: name.clone(),
            format: request.format,
            success: outcome.is_ok(),
            message: match &outcome {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
        });
        let (text, parsed, warnings) = outcome?;

        result.msg = if request.is_get_config() {
            "The \"get-config\" RPC executed successfully.".to_string()
        } else {
            "The RPC executed successfully.".to_string()
        };
        if let Some(recorder) = &self.recorder
            && let Err(e) = recorder.record_output(&name, &text)
        {
            warn!("{} failed to record RPC output: {}", self.label, e);
        }
        trace!("{} RPC {} returned {} bytes.", self.label, name, text.len());
        result.text = text;
        result.parsed = parsed;
        result.warnings = warnings;
        Ok(result)
    }

    async fn run_rpc(
        &mut self,
        request: &RpcRequest,
    ) -> Result<(String, Option<Value>, Vec<String>), DeviceError> {
        let name = request.rpc_name();
        let call = RpcCall {
            name: name.clone(),
            kwargs: request.kwargs.clone().unwrap_or_default(),
            attrs: request.attrs.clone().unwrap_or_default(),
            format: request.format,
            ignore_warning: WarningFilter::from_option(request.ignore_warning.as_ref()),
        };
        let reply = self
            .backend
            .rpc(&call)
            .await
            .map_err(|e| rpc_failure(&name, e))?;
        let (text, parsed) = normalize(request.format, reply.body).map_err(|e| rpc_failure(&name, e))?;
        Ok((text, parsed, reply.warnings))
    }

    async fn run_get_config(
        &mut self,
        request: &RpcRequest,
    ) -> Result<(String, Option<Value>, Vec<String>), DeviceError> {
        let fetch = get_config_fetch(request)?;
        let reply = self
            .backend
            .get_configuration(&fetch)
            .await
            .map_err(|e| rpc_failure("get-config", e))?;
        let warnings = reply.warnings.clone();
        let output = super::configuration::config_output(&fetch, reply)
            .map_err(|e| rpc_failure("get-config", e))?;
        Ok((output.text, output.parsed, warnings))
    }

    /// Execute every RPC of a batch in order.
    ///
    /// Argument lists are validated before anything is sent. A failing RPC
    /// is recorded in its result and the batch continues; the batch fails
    /// only when every RPC failed. Successful outputs go to `sink`.
    pub async fn execute_batch(
        &mut self,
        batch: &RpcBatch,
        mut sink: Option<&mut OutputSink>,
    ) -> Result<BatchResult, DeviceError> {
        let requests = batch.requests()?;
        self.open().await?;

        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            match self.execute_rpc(request).await {
                Ok(mut result) => {
                    if let Some(sink) = sink.as_deref_mut() {
                        result.dest = sink.save(&result.rpc, result.format.as_str(), &result.text)?;
                    }
                    results.push(result);
                }
                Err(e) => {
                    debug!("{} {}", self.label, e);
                    let mut result = RpcResult::new(request);
                    result.failed = true;
                    result.msg = e.to_string();
                    if let DeviceError::Rpc { warnings, .. } = e {
                        result.warnings = warnings;
                    }
                    results.push(result);
                }
            }
        }
        let failed = !results.is_empty() && results.iter().all(|r| r.failed);
        Ok(BatchResult { results, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> RpcBatch {
        RpcBatch::new([
            "get_software_information",
            "get-interface-information",
            "get-route-summary-information",
        ])
    }

    #[test]
    fn single_format_is_broadcast() {
        let mut batch = three();
        batch.formats = vec![RpcFormat::Text];
        let requests = batch.requests().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.format == RpcFormat::Text));
    }

    #[test]
    fn per_rpc_formats_are_kept_in_order() {
        let mut batch = three();
        batch.formats = vec![RpcFormat::Text, RpcFormat::Xml, RpcFormat::Json];
        let formats: Vec<_> = batch.requests().unwrap().iter().map(|r| r.format).collect();
        assert_eq!(formats, vec![RpcFormat::Text, RpcFormat::Xml, RpcFormat::Json]);
    }

    #[test]
    fn mismatched_formats_fail_validation() {
        let mut batch = three();
        batch.formats = vec![RpcFormat::Text, RpcFormat::Xml];
        assert_eq!(
            batch.requests().unwrap_err().to_string(),
            "The formats option must have a single value, or one value per rpc. There are 3 rpcs and 2 formats."
        );
    }

    #[test]
    fn kwargs_must_match_rpc_count() {
        let mut batch = three();
        batch.kwargs = Some(vec![ArgMap::new()]);
        assert_eq!(
            batch.requests().unwrap_err().to_string(),
            "The kwargs option must have one value per rpc. There are 3 rpcs and 1 kwargs."
        );
    }

    #[test]
    fn filter_requires_single_get_config() {
        let mut batch = three();
        batch.filter = Some("interfaces".into());
        assert!(batch.requests().is_err());

        let mut batch = RpcBatch::new(["get_config"]);
        batch.filter = Some("interfaces".into());
        assert_eq!(batch.requests().unwrap()[0].filter.as_deref(), Some("interfaces"));
    }

    #[test]
    fn ok_reply_normalizes_to_empty_text() {
        assert_eq!(
            normalize(RpcFormat::Xml, ReplyBody::Ok).unwrap(),
            (String::new(), None)
        );
    }

    #[test]
    fn text_format_reads_output_element() {
        let el = Element::new("output").with_text("\nHostname: r1\n");
        let (text, parsed) = normalize(RpcFormat::Text, ReplyBody::Element(el)).unwrap();
        assert_eq!(text, "\nHostname: r1\n");
        assert!(parsed.is_none());
    }

    #[test]
    fn format_mismatch_is_a_failure() {
        let err = normalize(RpcFormat::Json, ReplyBody::Text("plain".into())).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected json reply content: plain");
    }

    #[test]
    fn get_config_kwargs_select_database_and_model() {
        let request = RpcRequest::new("get-config")
            .with_kwarg("database", "candidate")
            .with_kwarg("model", "openconfig")
            .with_kwarg("remove_ns", false)
            .with_attr("inherit", "inherit");
        let fetch = get_config_fetch(&request).unwrap();
        assert_eq!(fetch.database, Database::Candidate);
        assert_eq!(fetch.model.as_deref(), Some("openconfig"));
        assert!(!fetch.remove_ns);
        assert_eq!(
            fetch.options.get("inherit"),
            Some(&ArgValue::Text("inherit".into()))
        );
    }
}
