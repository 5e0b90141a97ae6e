//! SCP over an SSH exec channel.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_ssh2_tokio::client::Client;
use log::debug;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::CHECKSUM_BLOCK_SIZE;
use crate::error::DeviceError;

fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

fn scp_error(message: impl Into<String>) -> DeviceError {
    DeviceError::rpc(format!("scp: {}", message.into()))
}

struct ScpChannel {
    channel: Channel<Msg>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl ScpChannel {
    async fn open(client: &Client, command: String, timeout: Duration) -> Result<Self, DeviceError> {
        let channel = client.get_channel().await?;
        channel.exec(true, command).await?;
        Ok(Self {
            channel,
            pending: VecDeque::new(),
            timeout,
        })
    }

    async fn fill(&mut self) -> Result<(), DeviceError> {
        loop {
            let msg = tokio::time::timeout(self.timeout, self.channel.wait())
                .await
                .map_err(|_| DeviceError::RpcTimeout("scp peer stopped responding".to_string()))?;
            match msg {
                Some(ChannelMsg::Data { data }) => {
                    self.pending.extend(data.iter().copied());
                    return Ok(());
                }
                Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
                    return Err(scp_error(format!("remote scp exited with status {exit_status}")));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(DeviceError::SessionClosed("scp channel closed".to_string()));
                }
                Some(_) => {}
            }
        }
    }

    async fn read_byte(&mut self) -> Result<u8, DeviceError> {
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return Ok(byte);
            }
            self.fill().await?;
        }
    }

    async fn read_line(&mut self) -> Result<String, DeviceError> {
        let mut line = Vec::new();
        loop {
            match self.read_byte().await? {
                b'\n' => return Ok(String::from_utf8_lossy(&line).into_owned()),
                byte => line.push(byte),
            }
        }
    }

    async fn expect_ack(&mut self) -> Result<(), DeviceError> {
        match self.read_byte().await? {
            0 => Ok(()),
            _ => Err(scp_error(self.read_line().await?)),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), DeviceError> {
        self.channel.data(data).await?;
        Ok(())
    }
}

/// Push `local` to `remote` using `scp -t`.
pub(super) async fn put(
    client: &Client,
    local: &Path,
    remote: &str,
    timeout: Duration,
) -> Result<u64, DeviceError> {
    let mut file = tokio::fs::File::open(local).await?;
    let size = file.metadata().await?.len();
    let name = remote.rsplit('/').next().unwrap_or(remote);

    let mut scp = ScpChannel::open(client, format!("scp -t {}", quote(remote)), timeout).await?;
    scp.expect_ack().await?;
    scp.send(format!("C0644 {size} {name}\n").as_bytes()).await?;
    scp.expect_ack().await?;

    let mut block = vec![0u8; CHECKSUM_BLOCK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut block).await?;
        if n == 0 {
            break;
        }
        scp.send(&block[..n]).await?;
        sent += n as u64;
    }
    scp.send(&[0]).await?;
    scp.expect_ack().await?;
    let _ = scp.channel.eof().await;
    debug!("scp put {} -> {remote}: {sent} bytes", local.display());
    Ok(sent)
}

/// Fetch `remote` into `local` using `scp -f`.
pub(super) async fn get(
    client: &Client,
    remote: &str,
    local: &Path,
    timeout: Duration,
) -> Result<u64, DeviceError> {
    let mut scp = ScpChannel::open(client, format!("scp -f {}", quote(remote)), timeout).await?;
    scp.send(&[0]).await?;

    let header = loop {
        let line = scp.read_line().await?;
        match line.as_bytes().first().copied() {
            Some(b'C') => break line,
            // Timestamps precede the file record when requested.
            Some(b'T') => scp.send(&[0]).await?,
            Some(1) | Some(2) => return Err(scp_error(line[1..].to_string())),
            _ => return Err(scp_error(format!("unexpected header: {line}"))),
        }
    };
    let size: u64 = header
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| scp_error(format!("malformed header: {header}")))?;
    scp.send(&[0]).await?;

    let mut file = tokio::fs::File::create(local).await?;
    let mut remaining = size;
    while remaining > 0 {
        if scp.pending.is_empty() {
            scp.fill().await?;
        }
        let take = (scp.pending.len() as u64).min(remaining) as usize;
        let chunk: Vec<u8> = scp.pending.drain(..take).collect();
        file.write_all(&chunk).await?;
        remaining -= take as u64;
    }
    file.flush().await?;
    scp.expect_ack().await?;
    scp.send(&[0]).await?;
    let _ = scp.channel.eof().await;
    debug!("scp get {remote} -> {}: {size} bytes", local.display());
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::quote;

    #[test]
    fn remote_paths_are_shell_quoted() {
        assert_eq!(quote("/var/tmp/a b"), "'/var/tmp/a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
