//! Passive-mode FTP client used for file copies to and from the device.

use std::path::Path;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::CHECKSUM_BLOCK_SIZE;
use crate::error::DeviceError;

const FTP_PORT: u16 = 21;

static PASV_REPLY: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)") {
        Ok(re) => re,
        Err(err) => panic!("invalid PASV regex: {err}"),
    }
});

fn ftp_error(message: impl Into<String>) -> DeviceError {
    DeviceError::rpc(format!("ftp: {}", message.into()))
}

/// One FTP reply, code plus the text of its last line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn parse_code(line: &str) -> Option<u16> {
        line.get(..3)?.parse().ok()
    }
}

/// Extract the data connection endpoint from a `227` reply.
fn passive_endpoint(text: &str) -> Option<(String, u16)> {
    let caps = PASV_REPLY.captures(text)?;
    let mut n = [0u16; 6];
    for (i, slot) in n.iter_mut().enumerate() {
        *slot = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    if n.iter().any(|v| *v > 255) {
        return None;
    }
    Some((format!("{}.{}.{}.{}", n[0], n[1], n[2], n[3]), n[4] * 256 + n[5]))
}

pub(super) struct FtpClient {
    control: BufReader<TcpStream>,
    timeout: Duration,
}

impl FtpClient {
    /// Log in and switch to binary mode.
    pub(super) async fn connect(
        address: &str,
        user: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((address, FTP_PORT)))
            .await
            .map_err(|_| DeviceError::Connection(format!("ftp connect to {address} timed out")))??;
        let mut client = Self {
            control: BufReader::new(stream),
            timeout,
        };
        client.expect(&[220]).await?;

        let reply = client.command(&format!("USER {user}")).await?;
        match reply.code {
            230 => {}
            331 => {
                client
                    .command_expect(&format!("PASS {}", password.unwrap_or_default()), &[230, 202])
                    .await?;
            }
            _ => return Err(ftp_error(format!("login rejected: {} {}", reply.code, reply.text))),
        }
        client.command_expect("TYPE I", &[200]).await?;
        debug!("ftp session to {address} ready");
        Ok(client)
    }

    async fn read_reply(&mut self) -> Result<Reply, DeviceError> {
        let control = &mut self.control;
        let read = async {
            let mut line = String::new();
            if control.read_line(&mut line).await? == 0 {
                return Err(DeviceError::SessionClosed("ftp control connection closed".to_string()));
            }
            let code = Reply::parse_code(&line)
                .ok_or_else(|| ftp_error(format!("malformed reply: {}", line.trim_end())))?;
            // Multi-line replies end on a line starting with the code and a space.
            if line.as_bytes().get(3) == Some(&b'-') {
                loop {
                    line.clear();
                    if control.read_line(&mut line).await? == 0 {
                        return Err(DeviceError::SessionClosed(
                            "ftp control connection closed".to_string(),
                        ));
                    }
                    if Reply::parse_code(&line) == Some(code) && line.as_bytes().get(3) == Some(&b' ') {
                        break;
                    }
                }
            }
            Ok(Reply {
                code,
                text: line.get(4..).unwrap_or_default().trim_end().to_string(),
            })
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| DeviceError::RpcTimeout("ftp server stopped responding".to_string()))?
    }

    async fn expect(&mut self, codes: &[u16]) -> Result<Reply, DeviceError> {
        let reply = self.read_reply().await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(ftp_error(format!("{} {}", reply.code, reply.text)))
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply, DeviceError> {
        let stream = self.control.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        self.read_reply().await
    }

    async fn command_expect(&mut self, line: &str, codes: &[u16]) -> Result<Reply, DeviceError> {
        let reply = self.command(line).await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(ftp_error(format!("{} {}", reply.code, reply.text)))
        }
    }

    async fn open_data(&mut self) -> Result<TcpStream, DeviceError> {
        let reply = self.command_expect("PASV", &[227]).await?;
        let (host, port) = passive_endpoint(&reply.text)
            .ok_or_else(|| ftp_error(format!("malformed PASV reply: {}", reply.text)))?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ftp_error(format!("data connection to {host}:{port} timed out")))??;
        Ok(stream)
    }

    pub(super) async fn put(&mut self, local: &Path, remote: &str) -> Result<u64, DeviceError> {
        let mut file = tokio::fs::File::open(local).await?;
        let mut data = self.open_data().await?;
        self.command_expect(&format!("STOR {remote}"), &[125, 150]).await?;

        let mut block = vec![0u8; CHECKSUM_BLOCK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut block).await?;
            if n == 0 {
                break;
            }
            data.write_all(&block[..n]).await?;
            sent += n as u64;
        }
        data.shutdown().await?;
        drop(data);
        self.expect(&[226, 250]).await?;
        debug!("ftp put {} -> {remote}: {sent} bytes", local.display());
        Ok(sent)
    }

    pub(super) async fn get(&mut self, remote: &str, local: &Path) -> Result<u64, DeviceError> {
        let mut data = self.open_data().await?;
        self.command_expect(&format!("RETR {remote}"), &[125, 150]).await?;

        let mut file = tokio::fs::File::create(local).await?;
        let mut block = vec![0u8; CHECKSUM_BLOCK_SIZE];
        let mut received = 0u64;
        loop {
            let n = data.read(&mut block).await?;
            if n == 0 {
                break;
            }
            file.write_all(&block[..n]).await?;
            received += n as u64;
        }
        file.flush().await?;
        self.expect(&[226, 250]).await?;
        debug!("ftp get {remote} -> {}: {received} bytes", local.display());
        Ok(received)
    }

    /// Say goodbye. Errors are irrelevant once the transfer has finished.
    pub(super) async fn quit(&mut self) {
        if let Err(e) = self.command("QUIT").await {
            debug!("ftp QUIT failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_reply_yields_data_endpoint() {
        let endpoint = passive_endpoint("Entering Passive Mode (192,168,1,10,195,80).");
        assert_eq!(endpoint, Some(("192.168.1.10".to_string(), 50000)));
    }

    #[test]
    fn passive_reply_rejects_out_of_range_octets() {
        assert_eq!(passive_endpoint("Entering Passive Mode (300,1,1,1,1,1)"), None);
        assert_eq!(passive_endpoint("Entering Passive Mode"), None);
    }

    #[test]
    fn reply_code_is_first_three_digits() {
        assert_eq!(Reply::parse_code("226 Transfer complete\r\n"), Some(226));
        assert_eq!(Reply::parse_code("22"), None);
    }
}
