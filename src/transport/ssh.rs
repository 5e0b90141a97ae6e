use std::path::Path;
use std::time::Duration;

use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::debug;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{FileProtocol, NetconfSession, Transport, console, ftp, scp};
use crate::error::DeviceError;
use crate::session::ConnectionParams;

/// NETCONF over SSH, either the `netconf` subsystem or a console server shell.
pub struct SshTransport {
    client: Client,
    session: NetconfSession,
    label: String,
    address: String,
    user: String,
    password: Option<String>,
    timeout: Duration,
}

/// Split complete UTF-8 text off the front of `pending`.
pub(super) fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(s) => s.len(),
        // An incomplete trailing sequence waits for the next chunk.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let bytes: Vec<u8> = pending.drain(..valid).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Pump a channel through an mpsc pair until either side goes away.
fn spawn_io(mut channel: Channel<Msg>, label: String) -> (Sender<String>, Receiver<String>) {
    let (sender_to_device, mut receiver_from_user) = mpsc::channel::<String>(256);
    let (sender_to_user, receiver_from_device) = mpsc::channel::<String>(256);

    tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            tokio::select! {
                Some(data) = receiver_from_user.recv() => {
                    if let Err(e) = channel.data(data.as_bytes()).await {
                        debug!("{} Failed to send data to channel: {:?}", label, e);
                        break;
                    }
                },
                Some(msg) = channel.wait() => {
                    match msg {
                        ChannelMsg::Data { ref data } => {
                            pending.extend_from_slice(data);
                            let text = take_utf8(&mut pending);
                            if !text.is_empty() && sender_to_user.send(text).await.is_err() {
                                debug!("{} Reply receiver dropped. Closing task.", label);
                                break;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            debug!("{} Channel exited with status code: {}", label, exit_status);
                            let _ = channel.eof().await;
                            break;
                        }
                        ChannelMsg::Eof | ChannelMsg::Close => {
                            debug!("{} Channel closed by device.", label);
                            break;
                        }
                        _ => {}
                    }
                },
                else => break,
            }
        }
        debug!("{} SSH I/O task ended.", label);
    });

    (sender_to_device, receiver_from_device)
}

impl SshTransport {
    async fn open_client(
        params: &ConnectionParams,
        user: &str,
        password: Option<&str>,
    ) -> Result<Client, DeviceError> {
        let port = params.tcp_port()?;
        let auth = match &params.ssh_private_key_file {
            Some(key) => AuthMethod::with_key_file(key, password),
            None => AuthMethod::with_password(password.unwrap_or_default()),
        };
        let config = Config {
            preferred: params.security.preferred(),
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let client = Client::connect_with_config(
            (params.address.clone(), port),
            user,
            auth,
            params.security.server_check.clone(),
            config,
        )
        .await?;
        debug!("[{}] SSH connection to {}:{} successful", params.host, params.address, port);
        Ok(client)
    }

    fn assemble(client: Client, session: NetconfSession, params: &ConnectionParams) -> Self {
        Self {
            client,
            session,
            label: format!("[{}]", params.host),
            address: params.address.clone(),
            user: params.user.clone(),
            password: params.password.clone(),
            timeout: params.timeout,
        }
    }

    /// Open the `netconf` subsystem on the device itself.
    pub async fn connect(params: &ConnectionParams) -> Result<Self, DeviceError> {
        let client = Self::open_client(params, &params.user, params.password.as_deref()).await?;
        let channel = client.get_channel().await?;
        channel.request_subsystem(true, "netconf").await?;
        let label = format!("[{}]", params.host);
        let (sender, recv) = spawn_io(channel, label.clone());
        let mut session = NetconfSession::new(sender, recv, label);
        session.hello(params.timeout).await?;
        Ok(Self::assemble(client, session, params))
    }

    /// Log in to a console server over SSH, then to the device console.
    pub async fn connect_console(params: &ConnectionParams) -> Result<Self, DeviceError> {
        let cs_user = params.cs_user.as_deref().unwrap_or(&params.user);
        let client = Self::open_client(params, cs_user, params.cs_passwd.as_deref()).await?;
        let channel = client.get_channel().await?;
        channel
            .request_pty(false, "vt100", 200, 24, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        let label = format!("[{}]", params.host);
        let (sender, mut recv) = spawn_io(channel, label.clone());
        console::login(&sender, &mut recv, params).await?;
        let mut session = NetconfSession::new(sender, recv, label);
        session.hello(params.timeout).await?;
        Ok(Self::assemble(client, session, params))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn rpc(&mut self, request: &str, timeout: Duration) -> Result<String, DeviceError> {
        if self.client.is_closed() {
            return Err(DeviceError::SessionClosed(format!(
                "{} SSH connection is closed",
                self.label
            )));
        }
        self.session.rpc(request, timeout).await
    }

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<u64, DeviceError> {
        match protocol {
            FileProtocol::Scp => scp::put(&self.client, local, remote, self.timeout).await,
            FileProtocol::Ftp => {
                let mut ftp = ftp::FtpClient::connect(
                    &self.address,
                    &self.user,
                    self.password.as_deref(),
                    self.timeout,
                )
                .await?;
                let sent = ftp.put(local, remote).await;
                ftp.quit().await;
                sent
            }
        }
    }

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<u64, DeviceError> {
        match protocol {
            FileProtocol::Scp => scp::get(&self.client, remote, local, self.timeout).await,
            FileProtocol::Ftp => {
                let mut ftp = ftp::FtpClient::connect(
                    &self.address,
                    &self.user,
                    self.password.as_deref(),
                    self.timeout,
                )
                .await?;
                let received = ftp.get(remote, local).await;
                ftp.quit().await;
                received
            }
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        debug!("{} Closing NETCONF session...", self.label);
        let result = if self.client.is_closed() {
            Ok(())
        } else {
            self.session.close(self.timeout).await
        };
        // async-ssh2-tokio closes the TCP connection when the client is dropped.
        debug!("{} NETCONF session closed", self.label);
        result
    }

    fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::take_utf8;

    #[test]
    fn split_multibyte_sequences_wait_for_the_rest() {
        let mut pending = "größe".as_bytes().to_vec();
        let tail = pending.split_off(3);
        let mut first = pending;
        assert_eq!(take_utf8(&mut first), "gr");
        first.extend_from_slice(&tail);
        assert_eq!(take_utf8(&mut first), "öße");
        assert!(first.is_empty());
    }
}
