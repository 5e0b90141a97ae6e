use super::*;

/// SSH algorithm policy for the NETCONF session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Modern algorithms only.
    #[default]
    Secure,
    /// Adds widely deployed CBC and SHA-1 variants.
    Balanced,
    /// Everything russh can negotiate; for old Junos releases.
    LegacyCompatible,
}

impl FromStr for SecurityLevel {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "secure" => Ok(SecurityLevel::Secure),
            "balanced" => Ok(SecurityLevel::Balanced),
            "legacy" | "legacy_compatible" => Ok(SecurityLevel::LegacyCompatible),
            other => Err(DeviceError::Validation(format!(
                "The security level {other} is invalid. Must be one of: secure, balanced, legacy_compatible"
            ))),
        }
    }
}

/// Algorithm policy plus host key verification for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        SecurityLevel::Secure.into()
    }
}

impl From<SecurityLevel> for ConnectionSecurityOptions {
    /// Legacy devices rarely have stable host keys in `known_hosts`, so that
    /// level skips verification.
    fn from(level: SecurityLevel) -> Self {
        let server_check = match level {
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
            _ => ServerCheckMethod::DefaultKnownHostsFile,
        };
        Self {
            level,
            server_check,
        }
    }
}

impl ConnectionSecurityOptions {
    /// Same level, explicit host key check.
    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = server_check;
        self
    }

    pub(crate) fn preferred(&self) -> Preferred {
        let (kex, key, cipher, mac) = match self.level {
            SecurityLevel::Secure => (
                config::SECURE_KEX_ORDER,
                config::SECURE_KEY_TYPES,
                config::SECURE_CIPHERS,
                config::SECURE_MAC_ALGORITHMS,
            ),
            SecurityLevel::Balanced => (
                config::BALANCED_KEX_ORDER,
                config::BALANCED_KEY_TYPES,
                config::BALANCED_CIPHERS,
                config::BALANCED_MAC_ALGORITHMS,
            ),
            SecurityLevel::LegacyCompatible => (
                config::LEGACY_KEX_ORDER,
                config::LEGACY_KEY_TYPES,
                config::LEGACY_CIPHERS,
                config::LEGACY_MAC_ALGORITHMS,
            ),
        };
        Preferred {
            kex: Cow::Borrowed(kex),
            key: Cow::Borrowed(key),
            cipher: Cow::Borrowed(cipher),
            mac: Cow::Borrowed(mac),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        }
    }
}
