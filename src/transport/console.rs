//! Console login up to the NETCONF prompt.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::DEFAULT_ATTEMPTS;
use crate::error::DeviceError;
use crate::session::ConnectionParams;

fn prompt(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid console prompt regex {pattern}: {err}"),
    }
}

static LOGIN_PROMPT: Lazy<Regex> = Lazy::new(|| prompt(r"(?i)(login|username):\s*$"));
static PASSWORD_PROMPT: Lazy<Regex> = Lazy::new(|| prompt(r"(?i)password:\s*$"));
static LOGIN_INCORRECT: Lazy<Regex> = Lazy::new(|| prompt(r"(?i)login incorrect"));
static SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| prompt(r"[%$]\s*$"));
static CLI_PROMPT: Lazy<Regex> = Lazy::new(|| prompt(r"[>#]\s*$"));

pub(super) const NETCONF_MODE_COMMAND: &str = "xml-mode netconf need-trailer\n";

/// Drive the console until NETCONF mode has been requested.
///
/// Every period of `params.timeout` without a recognisable prompt costs one
/// attempt, as does every rejected login.
pub(super) async fn login(
    sender: &Sender<String>,
    recv: &mut Receiver<String>,
    params: &ConnectionParams,
) -> Result<(), DeviceError> {
    let attempts = params.attempts.unwrap_or(DEFAULT_ATTEMPTS).max(1);
    let mut used = 0;
    let mut buffer = String::new();

    sender.send("\n".to_string()).await?;
    loop {
        let chunk = match tokio::time::timeout(params.timeout, recv.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return Err(DeviceError::SessionClosed(
                    "console closed during login".to_string(),
                ));
            }
            Err(_) => {
                used += 1;
                if used >= attempts {
                    return Err(DeviceError::Connection(format!(
                        "no console prompt from {} after {attempts} attempts",
                        params.host
                    )));
                }
                sender.send("\n".to_string()).await?;
                continue;
            }
        };
        buffer.push_str(&chunk);
        let last_line = buffer.rsplit('\n').next().unwrap_or_default();

        if LOGIN_INCORRECT.is_match(&buffer) {
            used += 1;
            if used >= attempts {
                return Err(DeviceError::Connection(format!(
                    "console login to {} rejected after {attempts} attempts",
                    params.host
                )));
            }
            buffer.clear();
            continue;
        }
        if LOGIN_PROMPT.is_match(last_line) {
            debug!("[{}] console login prompt", params.host);
            sender.send(format!("{}\n", params.user)).await?;
            buffer.clear();
        } else if PASSWORD_PROMPT.is_match(last_line) {
            let password = params.password.clone().unwrap_or_default();
            sender.send(format!("{password}\n")).await?;
            buffer.clear();
        } else if SHELL_PROMPT.is_match(last_line) {
            debug!("[{}] console at shell prompt, starting cli", params.host);
            sender.send("cli\n".to_string()).await?;
            buffer.clear();
        } else if CLI_PROMPT.is_match(last_line) {
            debug!("[{}] console at cli prompt, entering NETCONF mode", params.host);
            sender.send(NETCONF_MODE_COMMAND.to_string()).await?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn console_params() -> ConnectionParams {
        let mut params = ConnectionParams::new("cs1", "admin").with_password("pw");
        params.attempts = Some(2);
        params.timeout = Duration::from_millis(50);
        params
    }

    #[tokio::test]
    async fn login_walks_prompts_to_netconf_mode() {
        let (to_device, mut device_rx) = mpsc::channel::<String>(16);
        let (device_tx, mut from_device) = mpsc::channel::<String>(16);
        let params = console_params();

        let device = tokio::spawn(async move {
            let mut seen = Vec::new();
            assert_eq!(device_rx.recv().await.unwrap(), "\n");
            device_tx.send("\r\nrouter (ttyu0)\r\n\r\nlogin: ".into()).await.unwrap();
            seen.push(device_rx.recv().await.unwrap());
            device_tx.send("Password:".into()).await.unwrap();
            seen.push(device_rx.recv().await.unwrap());
            device_tx.send("\r\nroot@router:~ % ".into()).await.unwrap();
            seen.push(device_rx.recv().await.unwrap());
            device_tx.send("\r\nroot@router> ".into()).await.unwrap();
            seen.push(device_rx.recv().await.unwrap());
            seen
        });

        login(&to_device, &mut from_device, &params).await.expect("login");
        let seen = device.await.unwrap();
        assert_eq!(seen, vec!["admin\n", "pw\n", "cli\n", NETCONF_MODE_COMMAND]);
    }

    #[tokio::test]
    async fn silent_console_exhausts_attempts() {
        let (to_device, _device_rx) = mpsc::channel::<String>(16);
        let (_device_tx, mut from_device) = mpsc::channel::<String>(16);
        let err = login(&to_device, &mut from_device, &console_params())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
    }
}
