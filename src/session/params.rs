use super::*;
use clap::Parser;
use regex::Regex;
use std::fs;

/// How the NETCONF session reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// NETCONF over SSH.
    #[default]
    Default,
    /// NETCONF over a telnet console server.
    Telnet,
    /// NETCONF over a local serial port.
    Serial,
}

impl TransportMode {
    fn parse(raw: Option<&str>) -> Result<Self, DeviceError> {
        match raw {
            None | Some("none") => Ok(TransportMode::Default),
            Some("telnet") => Ok(TransportMode::Telnet),
            Some("serial") => Ok(TransportMode::Serial),
            Some(other) => Err(DeviceError::Validation(format!(
                "value of mode must be one of: telnet, serial, got: {other}"
            ))),
        }
    }
}

/// Port value as given by the caller: a number or a device path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{n}"),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

/// Resolved port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Port {
    Tcp(u16),
    /// Serial device path.
    Device(String),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Tcp(p) => write!(f, "{p}"),
            Port::Device(d) => f.write_str(d),
        }
    }
}

/// Whether operations run here or are forwarded to a session broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    #[default]
    Local,
    Delegated { socket_path: PathBuf },
}

/// Connection options as supplied by the caller.
///
/// Every field is optional; [`ConnectionOptions::resolve`] applies defaults
/// and validates combinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    #[serde(alias = "username")]
    pub user: Option<String>,
    #[serde(alias = "passwd")]
    pub password: Option<String>,
    #[serde(alias = "console_username")]
    pub cs_user: Option<String>,
    #[serde(alias = "console_password")]
    pub cs_passwd: Option<String>,
    #[serde(alias = "ssh_keyfile")]
    pub ssh_private_key_file: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub mode: Option<String>,
    /// Console shorthand, e.g. `--telnet cs1,7001` or `--port /dev/ttyS0 --baud 19200`.
    pub console: Option<String>,
    pub port: Option<PortValue>,
    pub baud: Option<u32>,
    pub attempts: Option<u32>,
    /// RPC timeout in seconds.
    pub timeout: Option<u64>,
    pub huge_tree: Option<bool>,
    /// SSH algorithm policy.
    pub security: Option<SecurityLevel>,
    /// Forward every operation to the session broker listening here.
    pub broker_socket: Option<PathBuf>,
}

/// Values derived from the `console` option.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsoleSettings {
    pub mode: TransportMode,
    pub host: Option<String>,
    pub port: Option<String>,
    pub baud: Option<String>,
    pub attempts: Option<String>,
}

/// Flags accepted inside the console shorthand.
#[derive(Debug, Parser)]
#[command(
    name = "console",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct ConsoleArgs {
    #[arg(short = 't', long)]
    telnet: Option<String>,
    #[arg(short = 'p', long)]
    port: Option<String>,
    #[arg(short = 'b', long)]
    baud: Option<String>,
    #[arg(short = 'a', long)]
    attempts: Option<String>,
    /// Accepted and ignored; the RPC timeout comes from `timeout`.
    #[arg(long = "timeout")]
    _timeout: Option<String>,
}

/// Parse the console shorthand.
pub fn parse_console(console: &str) -> Result<ConsoleSettings, DeviceError> {
    let parse_error = |reason: &str| {
        DeviceError::Validation(format!(
            "Unable to parse the console value ({console}). Error: {reason}"
        ))
    };

    let args = ConsoleArgs::try_parse_from(console.split_whitespace()).map_err(|e| {
        let rendered = e.to_string();
        let reason = rendered.lines().next().unwrap_or_default();
        parse_error(reason.trim_start_matches("error: "))
    })?;
    let telnet = args.telnet;
    let settings = ConsoleSettings {
        port: args.port,
        baud: args.baud,
        attempts: args.attempts,
        ..Default::default()
    };

    match telnet {
        Some(host_port) => {
            let Some((host, port)) = host_port.split_once(',') else {
                return Err(DeviceError::Validation(format!(
                    "Unable to parse the console value ({console}). The value of the console \
                     argument is typically in the format '--telnet \
                     <console_hostname>,<console_port_number>'."
                )));
            };
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| parse_error(&format!("invalid port number: '{port}'")))?;
            Ok(ConsoleSettings {
                mode: TransportMode::Telnet,
                host: Some(host.trim_matches([' ', '=']).to_string()),
                port: Some(port.to_string()),
                baud: None,
                attempts: None,
            })
        }
        None => Ok(ConsoleSettings {
            mode: TransportMode::Serial,
            ..settings
        }),
    }
}

/// Entries of an OpenSSH client config that apply to one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigEntry {
    pub host_name: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

fn glob_matches(pattern: &str, host: &str) -> bool {
    let regex = format!(
        "^{}$",
        regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".")
    );
    Regex::new(&regex).map(|re| re.is_match(host)).unwrap_or(false)
}

/// A `Host` line applies when a pattern matches and no negated pattern does.
fn host_line_matches(patterns: &str, host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns.split_whitespace() {
        match pattern.strip_prefix('!') {
            Some(negated) if glob_matches(negated, host) => return false,
            Some(_) => {}
            None => matched |= glob_matches(pattern, host),
        }
    }
    matched
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Look up `host` in an OpenSSH client config. First value wins.
pub fn ssh_config_lookup(content: &str, host: &str) -> SshConfigEntry {
    let mut entry = SshConfigEntry::default();
    let mut active = true;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
            Some((k, v)) => (k.to_ascii_lowercase(), v.trim_start_matches([' ', '=']).trim()),
            None => continue,
        };
        if key == "host" {
            active = host_line_matches(value, host);
            continue;
        }
        if !active {
            continue;
        }
        match key.as_str() {
            "hostname" if entry.host_name.is_none() => entry.host_name = Some(value.to_string()),
            "port" if entry.port.is_none() => entry.port = value.parse().ok(),
            "user" if entry.user.is_none() => entry.user = Some(value.to_string()),
            "identityfile" if entry.identity_file.is_none() => {
                entry.identity_file = Some(expand_home(value))
            }
            _ => {}
        }
    }
    entry
}

/// Validated connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Name the device is known by; used in logs and output file names.
    pub host: String,
    /// Address actually dialled (differs from `host` with an ssh_config HostName).
    pub address: String,
    pub user: String,
    pub password: Option<String>,
    pub cs_user: Option<String>,
    pub cs_passwd: Option<String>,
    pub ssh_private_key_file: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub mode: TransportMode,
    pub port: Port,
    pub baud: Option<u32>,
    pub attempts: Option<u32>,
    pub timeout: Duration,
    pub huge_tree: bool,
    pub kind: ConnectionKind,
    pub security: ConnectionSecurityOptions,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| config::REDACTED);
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("address", &self.address)
            .field("user", &self.user)
            .field("passwd", &redact(&self.password))
            .field("cs_user", &self.cs_user)
            .field("cs_passwd", &redact(&self.cs_passwd))
            .field("ssh_private_key_file", &self.ssh_private_key_file)
            .field("ssh_config", &self.ssh_config)
            .field("mode", &self.mode)
            .field("port", &self.port)
            .field("baud", &self.baud)
            .field("attempts", &self.attempts)
            .field("timeout", &self.timeout)
            .field("huge_tree", &self.huge_tree)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ConnectionParams {
    /// Parameters for an SSH session with defaults everywhere else.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            address: host.clone(),
            host,
            user: user.into(),
            password: None,
            cs_user: None,
            cs_passwd: None,
            ssh_private_key_file: None,
            ssh_config: None,
            mode: TransportMode::Default,
            port: Port::Tcp(config::DEFAULT_NETCONF_PORT),
            baud: None,
            attempts: None,
            timeout: config::DEFAULT_RPC_TIMEOUT,
            huge_tree: false,
            kind: ConnectionKind::Local,
            security: ConnectionSecurityOptions::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TCP port, or an error for serial device paths.
    pub fn tcp_port(&self) -> Result<u16, DeviceError> {
        match &self.port {
            Port::Tcp(port) => Ok(*port),
            Port::Device(path) => Err(DeviceError::Connection(format!(
                "port {path} is a serial device, not a TCP port"
            ))),
        }
    }

    /// Nesting limit applied to replies.
    pub fn max_xml_depth(&self) -> Option<usize> {
        (!self.huge_tree).then_some(config::DEFAULT_MAX_XML_DEPTH)
    }
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            user: Some(user.into()),
            ..Default::default()
        }
    }

    fn check_exclusive(&self) -> Result<(), DeviceError> {
        if self.console.is_none() {
            return Ok(());
        }
        let conflicts = [
            ("mode", self.mode.is_some()),
            ("port", self.port.is_some()),
            ("baud", self.baud.is_some()),
            ("attempts", self.attempts.is_some()),
            ("cs_user", self.cs_user.is_some()),
            ("cs_passwd", self.cs_passwd.is_some()),
        ];
        match conflicts.iter().find(|(_, set)| *set) {
            Some((name, _)) => Err(DeviceError::Validation(format!(
                "parameters are mutually exclusive: {name}|console"
            ))),
            None => Ok(()),
        }
    }

    /// Apply console parsing, defaults and validation.
    pub fn resolve(&self) -> Result<ConnectionParams, DeviceError> {
        self.check_exclusive()?;

        let mut host = self.host.clone();
        let mut mode = TransportMode::parse(self.mode.as_deref())?;
        let mut port = self.port.as_ref().map(|p| p.to_string());
        let mut baud = self.baud.map(|b| b.to_string());
        let mut attempts = self.attempts.map(|a| a.to_string());

        if let Some(console) = &self.console {
            let settings = parse_console(console)?;
            mode = settings.mode;
            if settings.host.is_some() {
                host = settings.host;
            }
            port = settings.port.or(port);
            baud = settings.baud.or(baud);
            attempts = settings.attempts.or(attempts);
        }

        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::Validation("missing required arguments: host".into()))?;
        let user = self
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DeviceError::Validation("missing required arguments: user".into()))?;

        let ssh_entry = match &self.ssh_config {
            Some(path) if mode == TransportMode::Default => {
                let content = fs::read_to_string(path).map_err(|e| {
                    DeviceError::Validation(format!(
                        "Unable to read the ssh_config file {}. {e}",
                        path.display()
                    ))
                })?;
                ssh_config_lookup(&content, &host)
            }
            _ => SshConfigEntry::default(),
        };

        let port = match (port, mode) {
            (None, TransportMode::Telnet) => Port::Tcp(config::DEFAULT_TELNET_PORT),
            (None, TransportMode::Serial) => Port::Device(config::DEFAULT_SERIAL_PORT.to_string()),
            (None, TransportMode::Default) => {
                Port::Tcp(ssh_entry.port.unwrap_or(config::DEFAULT_NETCONF_PORT))
            }
            (Some(raw), TransportMode::Serial) => Port::Device(raw),
            (Some(raw), _) => Port::Tcp(raw.trim().parse().map_err(|_| {
                DeviceError::Validation(format!(
                    "The port option ({raw}) must be an integer value."
                ))
            })?),
        };

        let parse_count = |name: &str, raw: String| {
            raw.trim().parse::<u32>().map_err(|_| {
                DeviceError::Validation(format!(
                    "The {name} option ({raw}) must be an integer value."
                ))
            })
        };
        let (baud, attempts) = match mode {
            TransportMode::Telnet | TransportMode::Serial => (
                Some(baud.map(|b| parse_count("baud", b)).transpose()?.unwrap_or(config::DEFAULT_BAUD)),
                Some(
                    attempts
                        .map(|a| parse_count("attempts", a))
                        .transpose()?
                        .unwrap_or(config::DEFAULT_ATTEMPTS),
                ),
            ),
            TransportMode::Default => {
                if let Some(baud) = baud {
                    return Err(DeviceError::Validation(format!(
                        "The baud option ({baud}) is not valid when mode == none."
                    )));
                }
                if let Some(attempts) = attempts {
                    return Err(DeviceError::Validation(format!(
                        "The attempts option ({attempts}) is not valid when mode == none."
                    )));
                }
                (None, None)
            }
        };

        let security = ConnectionSecurityOptions::from(self.security.unwrap_or_default());

        Ok(ConnectionParams {
            address: ssh_entry.host_name.unwrap_or_else(|| host.clone()),
            host,
            user,
            password: self.password.clone(),
            cs_user: self.cs_user.clone(),
            cs_passwd: self.cs_passwd.clone(),
            ssh_private_key_file: self
                .ssh_private_key_file
                .clone()
                .or(ssh_entry.identity_file),
            ssh_config: self.ssh_config.clone(),
            mode,
            port,
            baud,
            attempts,
            timeout: self
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(config::DEFAULT_RPC_TIMEOUT),
            huge_tree: self.huge_tree.unwrap_or(false),
            kind: match &self.broker_socket {
                Some(path) => ConnectionKind::Delegated {
                    socket_path: path.clone(),
                },
                None => ConnectionKind::Local,
            },
            security,
        })
    }
}
