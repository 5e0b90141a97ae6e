//! Typed option values parsed once at the API boundary.
//!
//! Raw option strings (formats, modes, rollback ids, ignore-warning lists,
//! `key=value` argument bundles) are converted here into enums and maps so
//! that nothing downstream has to re-interpret them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::BUILTIN_IGNORED_WARNING;
use crate::error::DeviceError;

macro_rules! choice_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every accepted value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn choices() -> String {
                Self::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DeviceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(DeviceError::Validation(format!(
                        "The {} {} is invalid. Must be one of: {}",
                        $what,
                        other,
                        Self::choices()
                    ))),
                }
            }
        }
    };
}

choice_enum! {
    /// Reply format requested from an RPC.
    RpcFormat, "format" {
        Text => "text",
        Xml => "xml",
        Json => "json",
    }
}

choice_enum! {
    /// Format of configuration returned by, or loaded into, the device.
    ConfigFormat, "configuration format" {
        Xml => "xml",
        Set => "set",
        Text => "text",
        Json => "json",
    }
}

choice_enum! {
    /// Configuration database to read from.
    Database, "configuration database" {
        Candidate => "candidate",
        Committed => "committed",
    }
}

choice_enum! {
    /// Checksum algorithm understood by `get-checksum-information`.
    ChecksumAlgorithm, "checksum algorithm" {
        Md5 => "md5",
        Sha256 => "sha256",
    }
}

impl Default for RpcFormat {
    fn default() -> Self {
        RpcFormat::Xml
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::Committed
    }
}

impl ChecksumAlgorithm {
    /// Name used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha256 => "SHA256",
        }
    }
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Md5
    }
}

/// Concurrency mode of a configuration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    /// Lock the shared candidate database.
    Exclusive,
    /// Private copy of the candidate database.
    Private,
    /// Dynamic database.
    Dynamic,
    /// Batch commits.
    Batch,
    /// Ephemeral database, optionally a named instance.
    Ephemeral,
}

impl ConfigMode {
    pub const ALL: &'static [ConfigMode] = &[
        ConfigMode::Exclusive,
        ConfigMode::Private,
        ConfigMode::Dynamic,
        ConfigMode::Batch,
        ConfigMode::Ephemeral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigMode::Exclusive => "exclusive",
            ConfigMode::Private => "private",
            ConfigMode::Dynamic => "dynamic",
            ConfigMode::Batch => "batch",
            ConfigMode::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                DeviceError::ConfigurationLock(format!("Invalid configuration mode: {s}"))
            })
    }
}

/// How a configuration load combines with the candidate database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoadAction {
    Set,
    Merge,
    Update,
    Replace,
    /// Also accepted as `overwrite`.
    #[serde(alias = "overwrite")]
    Override,
    Patch,
}

impl LoadAction {
    /// Value of the `action` attribute of `load-configuration`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadAction::Set => "set",
            LoadAction::Merge => "merge",
            LoadAction::Update => "update",
            LoadAction::Replace => "replace",
            LoadAction::Override => "override",
            LoadAction::Patch => "patch",
        }
    }
}

impl fmt::Display for LoadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadAction {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(LoadAction::Set),
            "merge" => Ok(LoadAction::Merge),
            "update" => Ok(LoadAction::Update),
            "replace" => Ok(LoadAction::Replace),
            "override" | "overwrite" => Ok(LoadAction::Override),
            "patch" => Ok(LoadAction::Patch),
            other => Err(DeviceError::Validation(format!(
                "The load action {other} is invalid. Must be one of: set, merge, update, replace, override, overwrite, patch"
            ))),
        }
    }
}

/// Target of a configuration rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum RollbackId {
    /// The saved rescue configuration.
    Rescue,
    /// A numbered rollback, 0 through 49.
    Numbered(u8),
}

impl RollbackId {
    pub const MAX: i64 = 49;

    fn invalid(raw: impl fmt::Display) -> DeviceError {
        DeviceError::Validation(format!(
            "The value of the rollback option ({raw}) is invalid. Must be the string 'rescue' or an int between 0 and 49."
        ))
    }
}

impl TryFrom<i64> for RollbackId {
    type Error = DeviceError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (0..=Self::MAX).contains(&value) {
            Ok(RollbackId::Numbered(value as u8))
        } else {
            Err(Self::invalid(value))
        }
    }
}

impl FromStr for RollbackId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "rescue" {
            return Ok(RollbackId::Rescue);
        }
        s.trim()
            .parse::<i64>()
            .map_err(|_| Self::invalid(s))
            .and_then(|value| RollbackId::try_from(value).map_err(|_| Self::invalid(s)))
    }
}

impl TryFrom<serde_json::Value> for RollbackId {
    type Error = DeviceError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match &value {
            serde_json::Value::String(s) => s.parse(),
            serde_json::Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| Self::invalid(&value))
                .and_then(RollbackId::try_from),
            _ => Err(Self::invalid(&value)),
        }
    }
}

impl From<RollbackId> for serde_json::Value {
    fn from(id: RollbackId) -> Self {
        match id {
            RollbackId::Rescue => serde_json::Value::String("rescue".to_string()),
            RollbackId::Numbered(n) => serde_json::Value::from(n),
        }
    }
}

impl fmt::Display for RollbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackId::Rescue => f.write_str("rescue"),
            RollbackId::Numbered(n) => write!(f, "{n}"),
        }
    }
}

/// Caller-supplied warning filter.
///
/// Accepted as a bool, a single pattern or a list of patterns. Patterns are
/// case-insensitive regular expressions searched within the warning text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum IgnoreWarning {
    Flag(bool),
    Pattern(String),
    Patterns(Vec<String>),
}

impl IgnoreWarning {
    /// Parse the list form of the option.
    ///
    /// A single element is read as a boolean when it looks like one and as
    /// a pattern otherwise; several elements form a pattern list.
    pub fn from_values(values: &[String]) -> Result<Self, DeviceError> {
        match values {
            [] => Err(DeviceError::Validation(
                "The value of the ignore_warning option ([]) is invalid.".to_string(),
            )),
            [single] => Ok(match parse_bool(single) {
                Some(flag) => IgnoreWarning::Flag(flag),
                None => IgnoreWarning::Pattern(single.clone()),
            }),
            many => Ok(IgnoreWarning::Patterns(many.to_vec())),
        }
    }
}

/// Effective warning filter applied to an RPC reply.
#[derive(Debug, Clone, Default)]
pub struct WarningFilter {
    ignore_all: bool,
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl WarningFilter {
    /// Filter that ignores nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Filter built from an optional caller value.
    pub fn from_option(option: Option<&IgnoreWarning>) -> Self {
        let mut filter = Self::none();
        if let Some(option) = option {
            filter.merge(option);
        }
        filter
    }

    /// Filter that always contains the open-configuration warning plus the
    /// caller's values.
    pub fn with_builtin(option: Option<&IgnoreWarning>) -> Self {
        let mut filter = Self::none();
        filter.push_pattern(BUILTIN_IGNORED_WARNING);
        if let Some(option) = option {
            filter.merge(option);
        }
        filter
    }

    fn merge(&mut self, option: &IgnoreWarning) {
        match option {
            IgnoreWarning::Flag(flag) => self.ignore_all |= *flag,
            IgnoreWarning::Pattern(pattern) => self.push_pattern(pattern),
            IgnoreWarning::Patterns(patterns) => {
                for pattern in patterns {
                    self.push_pattern(pattern);
                }
            }
        }
    }

    fn push_pattern(&mut self, pattern: &str) {
        if self.patterns.iter().any(|p| p == pattern) {
            return;
        }
        // Not every warning text is a valid regex; fall back to a literal match.
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(pattern))
                    .case_insensitive(true)
                    .build()
            });
        if let Ok(regex) = compiled {
            self.patterns.push(pattern.to_string());
            self.compiled.push(regex);
        }
    }

    /// True when every warning is ignored.
    pub fn ignores_all(&self) -> bool {
        self.ignore_all
    }

    /// Patterns in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when the warning message should not fail the RPC.
    pub fn is_ignored(&self, message: &str) -> bool {
        self.ignore_all || self.compiled.iter().any(|re| re.is_match(message))
    }

    /// Wire form used by the delegated broker.
    pub fn to_option(&self) -> IgnoreWarning {
        if self.ignore_all {
            IgnoreWarning::Flag(true)
        } else {
            IgnoreWarning::Patterns(self.patterns.clone())
        }
    }
}

/// Value of one keyword or attribute argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Text(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

/// Keyword or attribute arguments of a single RPC.
pub type ArgMap = BTreeMap<String, ArgValue>;

/// Interpret the boolean spellings accepted by playbook-style options.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "on" | "1" | "true" | "y" | "t" => Some(true),
        "no" | "off" | "0" | "false" | "n" | "f" => Some(false),
        _ => None,
    }
}

/// Parse a kwargs/attrs option into one argument map per RPC.
///
/// Accepts a JSON object, a JSON list of objects or `key=value` strings, or
/// a bare `key1=value1 key2=value2` string. With `allow_bool_values`, values
/// spelled like booleans become [`ArgValue::Bool`]; an element may override
/// the setting with its own `allow_bool_values` key.
pub fn parse_arg_bundle(
    option_name: &str,
    raw: &str,
    allow_bool_values: bool,
) -> Result<Vec<ArgMap>, DeviceError> {
    let invalid = |detail: &str| {
        DeviceError::Validation(format!(
            "The value of the {option_name} option ({raw}) is invalid. Unable to translate into a list of dicts.{detail}"
        ))
    };

    let elements: Vec<serde_json::Value> = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(value @ serde_json::Value::Object(_)) => vec![value],
        Ok(serde_json::Value::String(s)) => vec![serde_json::Value::String(s)],
        Ok(_) => return Err(invalid("")),
        Err(_) => vec![serde_json::Value::String(raw.to_string())],
    };

    let mut bundle = Vec::with_capacity(elements.len());
    for element in elements {
        let object = match element {
            serde_json::Value::Object(map) => map,
            serde_json::Value::String(s) => key_value_pairs(&s)
                .map_err(|detail| invalid(&format!(" {detail}")))?
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
            _ => return Err(invalid("")),
        };

        let mut allow_bool = allow_bool_values;
        let mut args = ArgMap::new();
        for (key, value) in object {
            if key == "allow_bool_values" {
                allow_bool = match &value {
                    serde_json::Value::Bool(b) => *b,
                    serde_json::Value::String(s) => parse_bool(s).unwrap_or(false),
                    _ => false,
                };
                continue;
            }
            let value = match value {
                serde_json::Value::Bool(b) => ArgValue::Bool(b),
                serde_json::Value::String(s) => ArgValue::Text(s),
                serde_json::Value::Null => ArgValue::Text(String::new()),
                serde_json::Value::Number(n) => ArgValue::Text(n.to_string()),
                _ => return Err(invalid("")),
            };
            args.insert(key, value);
        }
        if allow_bool {
            for value in args.values_mut() {
                if let ArgValue::Text(text) = value
                    && let Some(flag) = parse_bool(text)
                {
                    *value = ArgValue::Bool(flag);
                }
            }
        }
        bundle.push(args);
    }
    Ok(bundle)
}

/// Split `k1=v1 k2='v 2',k3=v3` into pairs, honouring single and double quotes.
fn key_value_pairs(input: &str) -> Result<Vec<(String, String)>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => quote = Some(ch),
            (None, c) if c.is_whitespace() || c == ',' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err("Unbalanced quotes.".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(format!("Element ({token}) is not in key=value form.")),
        })
        .collect()
}
