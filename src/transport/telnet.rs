//! NETCONF over a telnet console server.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::ssh::take_utf8;
use super::{FileProtocol, NetconfSession, Transport, console};
use crate::error::DeviceError;
use crate::session::ConnectionParams;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// What the console server sent, with telnet commands separated out.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TelnetInput {
    Data(Vec<u8>),
    Do(u8),
    Will(u8),
}

/// What we send to the console server.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TelnetOutput {
    Text(String),
    Wont(u8),
    Dont(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecoderState {
    #[default]
    Data,
    Command,
    Negotiate(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Telnet framing: payload bytes and option requests are told apart,
/// subnegotiations are skipped.
#[derive(Debug, Default)]
struct TelnetCodec {
    state: DecoderState,
    /// Negotiation decoded behind payload bytes that were returned first.
    queued: Option<TelnetInput>,
}

impl Decoder for TelnetCodec {
    type Item = TelnetInput;
    type Error = DeviceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TelnetInput>, DeviceError> {
        if let Some(input) = self.queued.take() {
            return Ok(Some(input));
        }
        let mut data = Vec::new();
        while src.has_remaining() {
            let byte = src.get_u8();
            let mut negotiated = None;
            self.state = match (self.state, byte) {
                (DecoderState::Data, IAC) => DecoderState::Command,
                (DecoderState::Data, b) => {
                    data.push(b);
                    DecoderState::Data
                }
                (DecoderState::Command, IAC) => {
                    data.push(IAC);
                    DecoderState::Data
                }
                (DecoderState::Command, cmd @ (DO | DONT | WILL | WONT)) => {
                    DecoderState::Negotiate(cmd)
                }
                (DecoderState::Command, SB) => DecoderState::Subnegotiation,
                (DecoderState::Command, _) => DecoderState::Data,
                (DecoderState::Negotiate(cmd), option) => {
                    negotiated = match cmd {
                        DO => Some(TelnetInput::Do(option)),
                        WILL => Some(TelnetInput::Will(option)),
                        _ => None,
                    };
                    DecoderState::Data
                }
                (DecoderState::Subnegotiation, IAC) => DecoderState::SubnegotiationIac,
                (DecoderState::Subnegotiation, _) => DecoderState::Subnegotiation,
                (DecoderState::SubnegotiationIac, SE) => DecoderState::Data,
                (DecoderState::SubnegotiationIac, _) => DecoderState::Subnegotiation,
            };
            if let Some(input) = negotiated {
                if data.is_empty() {
                    return Ok(Some(input));
                }
                self.queued = Some(input);
                return Ok(Some(TelnetInput::Data(data)));
            }
        }
        Ok((!data.is_empty()).then_some(TelnetInput::Data(data)))
    }
}

impl Encoder<TelnetOutput> for TelnetCodec {
    type Error = DeviceError;

    fn encode(&mut self, item: TelnetOutput, dst: &mut BytesMut) -> Result<(), DeviceError> {
        match item {
            // UTF-8 text never contains the IAC byte.
            TelnetOutput::Text(text) => dst.put_slice(text.as_bytes()),
            TelnetOutput::Wont(option) => dst.put_slice(&[IAC, WONT, option]),
            TelnetOutput::Dont(option) => dst.put_slice(&[IAC, DONT, option]),
        }
        Ok(())
    }
}

fn spawn_io(
    stream: TcpStream,
    label: String,
    connected: Arc<AtomicBool>,
) -> (Sender<String>, Receiver<String>) {
    let (sender_to_device, mut receiver_from_user) = mpsc::channel::<String>(256);
    let (sender_to_user, receiver_from_device) = mpsc::channel::<String>(256);
    let (mut sink, mut frames) = Framed::new(stream, TelnetCodec::default()).split();

    tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            tokio::select! {
                Some(data) = receiver_from_user.recv() => {
                    if let Err(e) = sink.send(TelnetOutput::Text(data)).await {
                        debug!("{} Failed to write to telnet socket: {:?}", label, e);
                        break;
                    }
                },
                frame = frames.next() => {
                    let input = match frame {
                        Some(Ok(input)) => input,
                        Some(Err(e)) => {
                            debug!("{} Telnet read failed: {:?}", label, e);
                            break;
                        }
                        None => {
                            debug!("{} Telnet connection closed by peer.", label);
                            break;
                        }
                    };
                    // Every option is refused; the console stays a plain NVT.
                    let refusal = match input {
                        TelnetInput::Do(option) => Some(TelnetOutput::Wont(option)),
                        TelnetInput::Will(option) => Some(TelnetOutput::Dont(option)),
                        TelnetInput::Data(data) => {
                            pending.extend_from_slice(&data);
                            None
                        }
                    };
                    if let Some(refusal) = refusal
                        && sink.send(refusal).await.is_err()
                    {
                        break;
                    }
                    let text = take_utf8(&mut pending);
                    if !text.is_empty() && sender_to_user.send(text).await.is_err() {
                        debug!("{} Reply receiver dropped. Closing task.", label);
                        break;
                    }
                },
            }
        }
        connected.store(false, Ordering::SeqCst);
        debug!("{} Telnet I/O task ended.", label);
    });

    (sender_to_device, receiver_from_device)
}

/// NETCONF over a console reached through a telnet console server.
pub struct TelnetTransport {
    session: NetconfSession,
    label: String,
    connected: Arc<AtomicBool>,
    timeout: Duration,
}

impl TelnetTransport {
    pub async fn connect(params: &ConnectionParams) -> Result<Self, DeviceError> {
        let port = params.tcp_port()?;
        let label = format!("[{}]", params.host);
        let stream = tokio::time::timeout(
            params.timeout,
            TcpStream::connect((params.address.as_str(), port)),
        )
        .await
        .map_err(|_| {
            DeviceError::Connection(format!("telnet connect to {}:{port} timed out", params.address))
        })??;
        debug!("{} telnet connection to {}:{} successful", label, params.address, port);

        let connected = Arc::new(AtomicBool::new(true));
        let (sender, mut recv) = spawn_io(stream, label.clone(), connected.clone());
        console::login(&sender, &mut recv, params).await?;
        let mut session = NetconfSession::new(sender, recv, label.clone());
        session.hello(params.timeout).await?;
        Ok(Self {
            session,
            label,
            connected,
            timeout: params.timeout,
        })
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn rpc(&mut self, request: &str, timeout: Duration) -> Result<String, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::SessionClosed(format!(
                "{} telnet connection is closed",
                self.label
            )));
        }
        self.session.rpc(request, timeout).await
    }

    async fn put_file(
        &mut self,
        protocol: FileProtocol,
        _local: &Path,
        _remote: &str,
    ) -> Result<u64, DeviceError> {
        Err(DeviceError::rpc(format!(
            "{protocol} file copy is not available over a telnet console session"
        )))
    }

    async fn get_file(
        &mut self,
        protocol: FileProtocol,
        _remote: &str,
        _local: &Path,
    ) -> Result<u64, DeviceError> {
        Err(DeviceError::rpc(format!(
            "{protocol} file copy is not available over a telnet console session"
        )))
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.session.close(self.timeout).await;
        self.connected.store(false, Ordering::SeqCst);
        debug!("{} telnet session closed", self.label);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut TelnetCodec, buf: &mut BytesMut) -> Vec<TelnetInput> {
        let mut inputs = Vec::new();
        while let Some(input) = codec.decode(buf).unwrap() {
            inputs.push(input);
        }
        inputs
    }

    #[test]
    fn negotiation_is_separated_from_data() {
        let mut codec = TelnetCodec::default();
        let mut buf = BytesMut::from(&[b'o', IAC, DO, 24, b'k', IAC, WILL, 1, IAC, IAC][..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![
                TelnetInput::Data(vec![b'o']),
                TelnetInput::Do(24),
                TelnetInput::Data(vec![b'k']),
                TelnetInput::Will(1),
                TelnetInput::Data(vec![IAC]),
            ]
        );
    }

    #[test]
    fn subnegotiation_split_across_reads_is_skipped() {
        let mut codec = TelnetCodec::default();
        let mut buf = BytesMut::from(&[b'a', IAC, SB, 31, 0, 80][..]);
        let mut inputs = decode_all(&mut codec, &mut buf);
        buf.extend_from_slice(&[0, 24, IAC, SE, b'b']);
        inputs.extend(decode_all(&mut codec, &mut buf));
        assert_eq!(
            inputs,
            vec![TelnetInput::Data(vec![b'a']), TelnetInput::Data(vec![b'b'])]
        );
    }

    #[test]
    fn refusals_and_text_are_encoded() {
        let mut codec = TelnetCodec::default();
        let mut out = BytesMut::new();
        codec.encode(TelnetOutput::Wont(24), &mut out).unwrap();
        codec.encode(TelnetOutput::Dont(1), &mut out).unwrap();
        codec
            .encode(TelnetOutput::Text("cli\n".to_string()), &mut out)
            .unwrap();
        let expected = [IAC, WONT, 24, IAC, DONT, 1, b'c', b'l', b'i', b'\n'];
        assert_eq!(&out[..], &expected[..]);
    }
}
