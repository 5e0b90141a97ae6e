//! Junos XML API requests and reply interpretation.

use crate::error::DeviceError;
use crate::options::{
    ArgValue, ChecksumAlgorithm, ConfigFormat, ConfigMode, RollbackId, WarningFilter,
};
use crate::xml::{Element, Node};

use super::{
    CommitPayload, ConfigFetch, LoadContent, LoadPayload, RebootRequest, ReplyBody, RpcCall,
    RpcReply,
};

pub(crate) const LOCK: &str = "<lock-configuration/>";
pub(crate) const UNLOCK: &str = "<unlock-configuration/>";
pub(crate) const CLOSE_CONFIGURATION: &str = "<close-configuration/>";
pub(crate) const COMMIT_CHECK: &str = "<commit-configuration><check/></commit-configuration>";
pub(crate) const DIFF: &str =
    r#"<get-configuration compare="rollback" rollback="0" format="text"/>"#;

const OPENCONFIG_NS: &str = "http://openconfig.net/yang/";
const IETF_NS: &str = "urn:ietf:params:xml:ns:yang:";

fn dashed(name: &str) -> String {
    name.replace('_', "-")
}

/// Build the XML for a generic RPC.
pub(crate) fn rpc_element(call: &RpcCall) -> Element {
    let mut rpc = Element::new(dashed(&call.name)).with_attr("format", call.format.as_str());
    for (key, value) in &call.kwargs {
        match value {
            ArgValue::Bool(_) => rpc.push(Element::new(dashed(key))),
            ArgValue::Text(text) => rpc.push(Element::new(dashed(key)).with_text(text.clone())),
        }
    }
    for (key, value) in &call.attrs {
        rpc.set_attr(dashed(key), value.to_string());
    }
    rpc
}

/// `open-configuration` for every mode except `exclusive`.
pub(crate) fn open_configuration(mode: ConfigMode, ephemeral_instance: Option<&str>) -> Element {
    let open = Element::new("open-configuration");
    match (mode, ephemeral_instance) {
        (ConfigMode::Ephemeral, Some(instance)) => {
            open.with_child(Element::new("ephemeral-instance").with_text(instance))
        }
        (mode, _) => open.with_child(Element::new(mode.as_str())),
    }
}

/// Turn a filter option into the element placed under `get-configuration`.
pub(crate) fn filter_element(filter: &str) -> Result<Element, DeviceError> {
    let trimmed = filter.trim();
    if trimmed.starts_with('<') {
        return Element::parse(trimmed);
    }
    let mut element: Option<Element> = None;
    for tag in trimmed.split('/').filter(|t| !t.is_empty()).rev() {
        let mut parent = Element::new(tag);
        if let Some(child) = element.take() {
            parent.push(child);
        }
        element = Some(parent);
    }
    element.ok_or_else(|| {
        DeviceError::Validation(format!("The filter option ({filter}) is invalid."))
    })
}

fn model_namespace(model: &str, namespace: Option<&str>, tag: &str) -> Result<String, DeviceError> {
    if let Some(ns) = namespace {
        return Ok(ns.to_string());
    }
    match model.to_ascii_lowercase().as_str() {
        "openconfig" => Ok(format!("{OPENCONFIG_NS}{tag}")),
        "ietf" => Ok(format!("{IETF_NS}{tag}")),
        "custom" => Err(DeviceError::Validation(
            "For \"custom\" model, explicitly provide \"namespace\"".to_string(),
        )),
        other => Err(DeviceError::Validation(format!(
            "The model option ({other}) is invalid. Must be one of: openconfig, ietf, custom"
        ))),
    }
}

pub(crate) fn get_configuration(fetch: &ConfigFetch) -> Result<Element, DeviceError> {
    let mut rpc = Element::new("get-configuration")
        .with_attr("database", fetch.database.as_str())
        .with_attr("format", fetch.format.as_str());
    for (key, value) in &fetch.options {
        if key != "database" && key != "format" {
            rpc.set_attr(dashed(key), value.to_string());
        }
    }
    if let Some(filter) = &fetch.filter {
        let mut filter = filter_element(filter)?;
        let yang = fetch.model.is_some() || fetch.namespace.is_some();
        if yang {
            let model = fetch.model.as_deref().unwrap_or("custom");
            let ns = model_namespace(model, fetch.namespace.as_deref(), &filter.name)?;
            filter.set_attr("xmlns", ns);
            rpc.push(filter);
        } else if filter.local_name() == "configuration" {
            rpc.push(filter);
        } else {
            rpc.push(Element::new("configuration").with_child(filter));
        }
    }
    Ok(rpc)
}

/// Top-level tag `get-configuration` answers with for `format`.
pub(crate) fn expected_config_tag(format: ConfigFormat) -> Option<&'static str> {
    match format {
        ConfigFormat::Xml => Some("configuration"),
        ConfigFormat::Text => Some("configuration-text"),
        ConfigFormat::Set => Some("configuration-set"),
        ConfigFormat::Json => None,
    }
}

pub(crate) fn load_configuration(payload: &LoadPayload) -> Result<Element, DeviceError> {
    let wire_format = match payload.format {
        ConfigFormat::Xml => "xml",
        ConfigFormat::Json => "json",
        ConfigFormat::Text | ConfigFormat::Set => "text",
    };
    let rpc = Element::new("load-configuration")
        .with_attr("action", payload.action.as_str())
        .with_attr("format", wire_format);
    match &payload.content {
        LoadContent::Url(url) => Ok(rpc.with_attr("url", url.clone())),
        LoadContent::Text(text) => Ok(match payload.format {
            ConfigFormat::Text => {
                rpc.with_child(Element::new("configuration-text").with_text(text.clone()))
            }
            ConfigFormat::Set => {
                rpc.with_child(Element::new("configuration-set").with_text(text.clone()))
            }
            ConfigFormat::Json => {
                rpc.with_child(Element::new("configuration-json").with_text(text.clone()))
            }
            ConfigFormat::Xml => {
                let config = Element::parse(text)?;
                if config.local_name() == "configuration" {
                    rpc.with_child(config)
                } else {
                    rpc.with_child(Element::new("configuration").with_child(config))
                }
            }
        }),
    }
}

pub(crate) fn commit_configuration(payload: &CommitPayload) -> Element {
    let mut rpc = Element::new("commit-configuration");
    if let Some(comment) = &payload.comment {
        rpc.push(Element::new("log").with_text(comment.clone()));
    }
    if let Some(minutes) = payload.confirmed {
        rpc.push(Element::new("confirmed"));
        rpc.push(Element::new("confirm-timeout").with_text(minutes.to_string()));
    }
    if payload.full {
        rpc.push(Element::new("full"));
    }
    if payload.sync || payload.force_sync {
        rpc.push(Element::new("synchronize"));
    }
    if payload.force_sync {
        rpc.push(Element::new("force-synchronize"));
    }
    rpc
}

pub(crate) fn rollback(id: RollbackId) -> Element {
    match id {
        RollbackId::Rescue => Element::new("load-configuration").with_attr("rescue", "rescue"),
        RollbackId::Numbered(n) => {
            Element::new("load-configuration").with_attr("rollback", n.to_string())
        }
    }
}

pub(crate) fn checksum(path: &str, algorithm: ChecksumAlgorithm) -> Element {
    let rpc = Element::new("get-checksum-information").with_child(Element::new("path").with_text(path));
    match algorithm {
        ChecksumAlgorithm::Md5 => rpc,
        other => rpc.with_child(Element::new("type").with_text(other.as_str())),
    }
}

pub(crate) fn reboot(request: &RebootRequest) -> Element {
    let mut rpc = if request.vmhost {
        Element::new("request-vmhost-reboot")
    } else {
        Element::new("request-reboot")
    };
    if request.all_re {
        if request.vmhost {
            rpc.push(Element::new("routing-engine").with_text("both"));
        } else {
            rpc.push(Element::new("both-routing-engines"));
        }
    }
    if let Some(minutes) = request.in_minutes {
        rpc.push(Element::new("in").with_text(minutes.to_string()));
    }
    if let Some(at) = &request.at {
        rpc.push(Element::new("at").with_text(at.clone()));
    }
    if let Some(member) = &request.member_id {
        rpc.push(Element::new("member").with_text(member.clone()));
    }
    rpc
}

/// Text of the first `request-reboot-status` in a reboot reply.
pub(crate) fn reboot_status(reply: &RpcReply) -> Option<String> {
    let status = match &reply.body {
        ReplyBody::Element(el) if el.local_name() == "request-reboot-status" => {
            Some(el.text().trim().to_string())
        }
        ReplyBody::Element(el) => el.find_text("request-reboot-status"),
        ReplyBody::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    };
    status.filter(|status| !status.is_empty())
}

fn is_warning(error: &Element) -> bool {
    error
        .find_text("error-severity")
        .is_some_and(|severity| severity.eq_ignore_ascii_case("warning"))
}

/// The `ping-results` element of a ping reply.
///
/// Only errors placed directly under `rpc-reply` fail the call. Errors
/// inside the results describe the ping itself and are left to the caller.
pub(crate) fn ping_results(raw: &str, max_depth: Option<usize>) -> Result<Element, DeviceError> {
    let root = Element::parse_with_depth(raw.trim(), max_depth)?;
    if root.local_name() != "rpc-reply" {
        return Ok(root);
    }
    let errors: Vec<String> = root
        .elements()
        .filter(|el| el.local_name() == "rpc-error" && !is_warning(el))
        .map(describe_error)
        .collect();
    if !errors.is_empty() {
        return Err(DeviceError::rpc(errors.join("; ")));
    }
    root.elements()
        .find(|el| el.local_name() != "rpc-error")
        .cloned()
        .ok_or_else(|| DeviceError::rpc(format!("Unexpected ping response: {}", root.to_xml())))
}

/// Errors and warnings reported inside `ping-results`, in document order.
pub(crate) fn ping_problems(results: &Element) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for error in results.elements().filter(|el| el.local_name() == "rpc-error") {
        let message = error.find_text("error-message").unwrap_or_default();
        if is_warning(error) {
            warnings.push(message);
        } else {
            errors.push(message);
        }
    }
    (errors, warnings)
}

fn describe_error(error: &Element) -> String {
    let message = error
        .find_text("error-message")
        .or_else(|| error.find_text("message"))
        .unwrap_or_else(|| error.text().trim().to_string());
    let mut out = message;
    if let Some(bad) = error
        .find_text("bad-element")
        .filter(|b| !b.is_empty())
    {
        out.push_str(&format!(" (bad element: {bad})"));
    }
    if let Some(info) = error.find_text("error-info").filter(|i| !i.is_empty()) {
        out.push_str(&format!(" ({info})"));
    }
    out
}

/// Errors and warnings carried anywhere in a reply.
pub(crate) fn reply_problems(root: &Element) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut found = Vec::new();
    root.find_all("rpc-error", &mut found);
    for error in found {
        let severity = error
            .find_text("error-severity")
            .unwrap_or_else(|| "error".to_string());
        if severity.eq_ignore_ascii_case("warning") {
            warnings.push(describe_error(error));
        } else {
            errors.push(describe_error(error));
        }
    }

    // Load results report problems as xnm:error / xnm:warning.
    let mut stack: Vec<&Element> = vec![root];
    while let Some(el) = stack.pop() {
        for child in el.elements() {
            match child.name.as_str() {
                "xnm:error" => errors.push(describe_error(child)),
                "xnm:warning" => warnings.push(describe_error(child)),
                _ => stack.push(child),
            }
        }
    }
    (errors, warnings)
}

/// Interpret an `<rpc-reply>` document.
///
/// Errors fail the call. Warnings fail it too unless `filter` ignores every
/// one of them, in which case they are returned alongside the body.
pub(crate) fn parse_reply(
    raw: &str,
    json: bool,
    filter: &WarningFilter,
    max_depth: Option<usize>,
) -> Result<RpcReply, DeviceError> {
    let root = Element::parse_with_depth(raw, max_depth)?;
    if root.local_name() != "rpc-reply" {
        return Err(DeviceError::rpc(format!(
            "Unexpected reply element <{}>: {}",
            root.name,
            root.to_xml()
        )));
    }

    let (errors, warnings) = reply_problems(&root);
    if !errors.is_empty() {
        return Err(DeviceError::Rpc {
            message: errors.join("; "),
            warnings,
        });
    }
    let unexpected: Vec<&String> = warnings.iter().filter(|w| !filter.is_ignored(w)).collect();
    if !unexpected.is_empty() {
        return Err(DeviceError::Rpc {
            message: unexpected
                .iter()
                .map(|w| format!("warning: {w}"))
                .collect::<Vec<_>>()
                .join("; "),
            warnings,
        });
    }

    let mut body_elements = root
        .children
        .into_iter()
        .filter_map(|node| match node {
            Node::Element(el) if el.local_name() != "rpc-error" => Some(Ok(el)),
            Node::Text(text) if !text.trim().is_empty() => Some(Err(text)),
            _ => None,
        });
    let body = match body_elements.next() {
        None => ReplyBody::Ok,
        Some(Ok(el)) if el.local_name() == "ok" => ReplyBody::Ok,
        Some(Ok(el)) => ReplyBody::Element(el),
        Some(Err(text)) if json => ReplyBody::Json(serde_json::from_str(text.trim())?),
        Some(Err(text)) => ReplyBody::Text(text),
    };
    Ok(RpcReply { body, warnings })
}

/// Extract a `configuration-output` diff.
pub(crate) fn diff_text(reply: &RpcReply) -> Option<String> {
    let text = match &reply.body {
        ReplyBody::Element(el) if el.local_name() == "configuration-output" => el.text(),
        ReplyBody::Element(el) => el.find_text("configuration-output")?,
        ReplyBody::Text(text) => text.clone(),
        _ => return None,
    };
    if text.trim().is_empty() { None } else { Some(text) }
}

/// Extract the checksum from a `get-checksum-information` reply.
pub(crate) fn checksum_value(reply: &RpcReply) -> Result<String, DeviceError> {
    let checksum = match &reply.body {
        ReplyBody::Element(el) => el.find_text("checksum").filter(|c| !c.is_empty()),
        _ => None,
    };
    checksum.ok_or_else(|| DeviceError::rpc("checksum missing from get-checksum-information reply"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{LoadAction, RpcFormat};
    use std::time::Duration;

    #[test]
    fn rpc_element_dashes_names_and_renders_booleans() {
        let mut call = RpcCall::new("get_interface_information", RpcFormat::Text);
        call.kwargs.insert("interface_name".into(), "ge-0/0/0".into());
        call.kwargs.insert("terse".into(), true.into());
        call.kwargs.insert("detail".into(), false.into());
        call.attrs.insert("junos_style".into(), "x".into());

        let xml = rpc_element(&call).to_xml();
        assert_eq!(
            xml,
            r#"<get-interface-information format="text" junos-style="x"><detail/><interface-name>ge-0/0/0</interface-name><terse/></get-interface-information>"#
        );
    }

    #[test]
    fn ping_results_keep_embedded_errors_for_the_caller() {
        let raw = "<rpc-reply><ping-results><rpc-error><error-severity>error</error-severity><error-message>\ncannot resolve nohost\n</error-message></rpc-error></ping-results></rpc-reply>";
        let results = ping_results(raw, None).unwrap();
        assert_eq!(results.local_name(), "ping-results");
        let (errors, warnings) = ping_problems(&results);
        assert_eq!(errors, vec!["cannot resolve nohost".to_string()]);
        assert!(warnings.is_empty());

        let raw = "<rpc-reply><rpc-error><error-severity>error</error-severity><error-message>syntax error</error-message></rpc-error></rpc-reply>";
        assert!(matches!(ping_results(raw, None), Err(DeviceError::Rpc { .. })));
    }

    #[test]
    fn open_configuration_carries_mode_flag() {
        assert_eq!(
            open_configuration(ConfigMode::Private, None).to_xml(),
            "<open-configuration><private/></open-configuration>"
        );
        assert_eq!(
            open_configuration(ConfigMode::Ephemeral, Some("eph1")).to_xml(),
            "<open-configuration><ephemeral-instance>eph1</ephemeral-instance></open-configuration>"
        );
    }

    #[test]
    fn hierarchy_filter_is_nested_under_configuration() {
        let fetch = ConfigFetch {
            filter: Some("system/services".to_string()),
            ..ConfigFetch::default()
        };
        assert_eq!(
            get_configuration(&fetch).unwrap().to_xml(),
            r#"<get-configuration database="committed" format="xml"><configuration><system><services/></system></configuration></get-configuration>"#
        );
    }

    #[test]
    fn model_filter_gets_a_namespace() {
        let fetch = ConfigFetch {
            filter: Some("<bgp/>".to_string()),
            model: Some("openconfig".to_string()),
            ..ConfigFetch::default()
        };
        let rpc = get_configuration(&fetch).unwrap();
        assert_eq!(
            rpc.child("bgp").and_then(|b| b.attr("xmlns")),
            Some("http://openconfig.net/yang/bgp")
        );

        let custom = ConfigFetch {
            filter: Some("<x/>".to_string()),
            model: Some("custom".to_string()),
            ..ConfigFetch::default()
        };
        assert!(matches!(get_configuration(&custom), Err(DeviceError::Validation(_))));
    }

    #[test]
    fn set_load_uses_configuration_set() {
        let payload = LoadPayload {
            action: LoadAction::Set,
            format: ConfigFormat::Set,
            content: LoadContent::Text("set system host-name r1".to_string()),
            ignore_warning: WarningFilter::none(),
        };
        assert_eq!(
            load_configuration(&payload).unwrap().to_xml(),
            r#"<load-configuration action="set" format="text"><configuration-set>set system host-name r1</configuration-set></load-configuration>"#
        );
    }

    #[test]
    fn commit_options_render_in_order() {
        let payload = CommitPayload {
            comment: Some("change 42".to_string()),
            confirmed: Some(5),
            timeout: Duration::from_secs(30),
            full: true,
            sync: false,
            force_sync: true,
            ignore_warning: WarningFilter::none(),
        };
        assert_eq!(
            commit_configuration(&payload).to_xml(),
            "<commit-configuration><log>change 42</log><confirmed/><confirm-timeout>5</confirm-timeout><full/><synchronize/><force-synchronize/></commit-configuration>"
        );
    }

    #[test]
    fn rpc_errors_fail_and_warnings_can_be_ignored() {
        let raw = r#"<rpc-reply><load-configuration-results><rpc-error><error-severity>error</error-severity><error-message>syntax error</error-message><bad-element>bogus</bad-element></rpc-error></load-configuration-results></rpc-reply>"#;
        let err = parse_reply(raw, false, &WarningFilter::none(), None).unwrap_err();
        assert_eq!(err.to_string(), "syntax error (bad element: bogus)");

        let warn = r#"<rpc-reply><rpc-error><error-severity>warning</error-severity><error-message>uncommitted changes will be discarded on exit</error-message></rpc-error><ok/></rpc-reply>"#;
        assert!(parse_reply(warn, false, &WarningFilter::none(), None).is_err());
        let reply = parse_reply(warn, false, &WarningFilter::with_builtin(None), None).unwrap();
        assert_eq!(reply.body, ReplyBody::Ok);
        assert_eq!(reply.warnings.len(), 1);
    }

    #[test]
    fn json_replies_are_decoded() {
        let raw = r#"<rpc-reply>{"software-information": [{"host-name": [{"data": "r1"}]}]}</rpc-reply>"#;
        let reply = parse_reply(raw, true, &WarningFilter::none(), None).unwrap();
        match reply.body {
            ReplyBody::Json(value) => {
                assert_eq!(value["software-information"][0]["host-name"][0]["data"], "r1")
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn empty_diff_is_none() {
        let raw = "<rpc-reply><configuration-information><configuration-output>\n</configuration-output></configuration-information></rpc-reply>";
        let reply = parse_reply(raw, false, &WarningFilter::none(), None).unwrap();
        assert_eq!(diff_text(&reply), None);
    }

    #[test]
    fn reboot_variants() {
        let request = RebootRequest {
            all_re: true,
            member_id: Some("1".to_string()),
            ..RebootRequest::default()
        };
        assert_eq!(
            reboot(&request).to_xml(),
            "<request-reboot><both-routing-engines/><member>1</member></request-reboot>"
        );
        let vmhost = RebootRequest {
            vmhost: true,
            all_re: true,
            ..RebootRequest::default()
        };
        assert_eq!(
            reboot(&vmhost).to_xml(),
            "<request-vmhost-reboot><routing-engine>both</routing-engine></request-vmhost-reboot>"
        );
    }
}
