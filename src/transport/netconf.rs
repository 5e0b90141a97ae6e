//! NETCONF 1.0 message framing over a byte pipe.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DeviceError;
use crate::xml::Element;

/// End-of-message marker of the NETCONF 1.0 framing.
pub const NETCONF_DELIMITER: &str = "]]>]]>";

const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

static REPLY_MESSAGE_ID: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r#"^\s*(?:<\?xml[^>]*>\s*)?<(?:[\w.-]+:)?rpc-reply\b[^>]*?\bmessage-id\s*=\s*["']([^"']*)["']"#,
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid REPLY_MESSAGE_ID regex: {err}"),
    }
});

/// `message-id` of an `<rpc-reply>`, if the message is one and carries it.
fn reply_message_id(message: &str) -> Option<&str> {
    REPLY_MESSAGE_ID
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Splits a byte stream on the `]]>]]>` end-of-message marker.
#[derive(Debug, Default)]
pub struct NetconfCodec {
    /// Bytes of the buffer already known not to hold a marker.
    scanned: usize,
}

impl Decoder for NetconfCodec {
    type Item = String;
    type Error = DeviceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, DeviceError> {
        let delimiter = NETCONF_DELIMITER.as_bytes();
        let start = self.scanned.saturating_sub(delimiter.len() - 1);
        let found = src[start..]
            .windows(delimiter.len())
            .position(|window| window == delimiter);
        let Some(offset) = found else {
            self.scanned = src.len();
            return Ok(None);
        };
        self.scanned = 0;
        let frame = src.split_to(start + offset);
        src.advance(delimiter.len());
        Ok(Some(String::from_utf8_lossy(&frame).trim().to_string()))
    }
}

impl Encoder<&str> for NetconfCodec {
    type Error = DeviceError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), DeviceError> {
        dst.reserve(item.len() + NETCONF_DELIMITER.len());
        dst.put_slice(item.as_bytes());
        dst.put_slice(NETCONF_DELIMITER.as_bytes());
        Ok(())
    }
}

/// Request/response exchange over a channel pair fed by an I/O task.
pub struct NetconfSession {
    sender: Sender<String>,
    recv: Receiver<String>,
    buffer: BytesMut,
    codec: NetconfCodec,
    message_id: u64,
    label: String,
    session_id: Option<String>,
}

impl NetconfSession {
    pub fn new(sender: Sender<String>, recv: Receiver<String>, label: impl Into<String>) -> Self {
        Self {
            sender,
            recv,
            buffer: BytesMut::new(),
            codec: NetconfCodec::default(),
            message_id: 0,
            label: label.into(),
            session_id: None,
        }
    }

    /// Read the server hello and answer with ours.
    pub async fn hello(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let raw = self.read_message(timeout).await?;
        // Console sessions echo the xml-mode command ahead of the hello.
        let start = raw
            .find("<?xml")
            .or_else(|| raw.find("<hello"))
            .ok_or_else(|| {
                DeviceError::Connection(format!("expected NETCONF hello, received: {raw}"))
            })?;
        let hello = Element::parse(&raw[start..])?;
        if hello.local_name() != "hello" {
            return Err(DeviceError::Connection(format!(
                "expected NETCONF hello, received <{}>",
                hello.name
            )));
        }
        self.session_id = hello.find_text("session-id");
        debug!(
            "{} NETCONF hello received, session-id {:?}",
            self.label, self.session_id
        );

        let client_hello = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><hello xmlns="{BASE_NS}"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities></hello>"#
        );
        self.send(&client_hello).await
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn send(&mut self, message: &str) -> Result<(), DeviceError> {
        let mut framed = BytesMut::new();
        self.codec.encode(message, &mut framed)?;
        self.sender
            .send(String::from_utf8_lossy(&framed).into_owned())
            .await?;
        Ok(())
    }

    /// Send `body` wrapped in `<rpc>` and wait for the reply carrying its
    /// `message-id`.
    ///
    /// Replies to earlier requests that timed out are discarded on the way.
    pub async fn rpc(&mut self, body: &str, timeout: Duration) -> Result<String, DeviceError> {
        self.message_id += 1;
        let id = self.message_id.to_string();
        let request = format!(r#"<rpc xmlns="{BASE_NS}" message-id="{id}">{body}</rpc>"#);
        trace!("{} >> {}", self.label, request);
        self.send(&request).await?;

        let reply = match tokio::time::timeout(timeout, self.reply_to(&id)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(Self::timed_out(timeout)),
        };
        trace!("{} << {}", self.label, reply);
        Ok(reply)
    }

    async fn reply_to(&mut self, id: &str) -> Result<String, DeviceError> {
        loop {
            let message = self.next_message().await?;
            match reply_message_id(&message) {
                Some(other) if other != id => {
                    debug!(
                        "{} Discarding late reply to message {} while waiting for {}.",
                        self.label, other, id
                    );
                }
                _ => return Ok(message),
            }
        }
    }

    async fn next_message(&mut self) -> Result<String, DeviceError> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(message);
            }
            match self.recv.recv().await {
                Some(chunk) => self.buffer.extend_from_slice(chunk.as_bytes()),
                None => {
                    return Err(DeviceError::SessionClosed(
                        "connection closed while waiting for a reply".to_string(),
                    ));
                }
            }
        }
    }

    async fn read_message(&mut self, timeout: Duration) -> Result<String, DeviceError> {
        match tokio::time::timeout(timeout, self.next_message()).await {
            Ok(message) => message,
            Err(_) => Err(Self::timed_out(timeout)),
        }
    }

    fn timed_out(timeout: Duration) -> DeviceError {
        DeviceError::RpcTimeout(format!("no reply within {} seconds", timeout.as_secs()))
    }

    /// Ask the server to end the session and stop reading.
    pub async fn close(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let result = self.rpc("<close-session/>", timeout).await.map(|_| ());
        self.recv.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const SERVER_HELLO: &str = r#"<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities><session-id>4711</session-id></hello>]]>]]>"#;

    #[test]
    fn codec_splits_on_marker_across_reads() {
        let mut codec = NetconfCodec::default();
        let mut buf = BytesMut::from("<rpc-reply><ok/></rpc-reply>]]>");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"]]>\n<rpc-reply/>]]>]]>");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("<rpc-reply><ok/></rpc-reply>")
        );
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("<rpc-reply/>"));
        assert!(buf.is_empty());

        let mut out = BytesMut::new();
        codec.encode("<rpc/>", &mut out).unwrap();
        assert_eq!(&out[..], b"<rpc/>]]>]]>");
    }

    #[test]
    fn message_id_is_read_from_the_reply_root() {
        assert_eq!(
            reply_message_id(r#"<?xml version="1.0"?><nc:rpc-reply xmlns:nc="x" message-id="7"><ok/></nc:rpc-reply>"#),
            Some("7")
        );
        assert_eq!(reply_message_id("<rpc-reply><ok/></rpc-reply>"), None);
        assert_eq!(reply_message_id(r#"<hello message-id="1"/>"#), None);
    }

    #[tokio::test]
    async fn hello_then_rpc_over_split_chunks() {
        let (to_device, mut device_rx) = mpsc::channel::<String>(16);
        let (device_tx, from_device) = mpsc::channel::<String>(16);
        let mut session = NetconfSession::new(to_device, from_device, "[r1]");

        device_tx.send("xml-mode netconf need-trailer\r\n".into()).await.unwrap();
        device_tx.send(SERVER_HELLO.into()).await.unwrap();
        session.hello(Duration::from_secs(1)).await.expect("hello");
        assert_eq!(session.session_id(), Some("4711"));
        let client_hello = device_rx.recv().await.unwrap();
        assert!(client_hello.contains("<hello"));
        assert!(client_hello.ends_with(NETCONF_DELIMITER));

        let responder = tokio::spawn(async move {
            let request = device_rx.recv().await.unwrap();
            assert!(request.contains(r#"message-id="1""#));
            assert!(request.contains("<get-software-information/>"));
            device_tx.send("<rpc-reply><software-".into()).await.unwrap();
            device_tx
                .send("information/></rpc-reply>]]>]]>".into())
                .await
                .unwrap();
            device_tx
        });
        let reply = session
            .rpc("<get-software-information/>", Duration::from_secs(1))
            .await
            .expect("rpc");
        assert_eq!(reply, "<rpc-reply><software-information/></rpc-reply>");
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_one() {
        let (to_device, _device_rx) = mpsc::channel::<String>(16);
        let (device_tx, from_device) = mpsc::channel::<String>(16);
        let mut session = NetconfSession::new(to_device, from_device, "[r1]");

        let err = session
            .rpc("<commit-configuration/>", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RpcTimeout(_)));

        device_tx
            .send(r#"<rpc-reply message-id="1"><commit-results/></rpc-reply>]]>]]>"#.into())
            .await
            .unwrap();
        device_tx
            .send(r#"<rpc-reply message-id="2"><system-uptime-information/></rpc-reply>]]>]]>"#.into())
            .await
            .unwrap();
        let reply = session
            .rpc("<get-system-uptime-information/>", Duration::from_secs(1))
            .await
            .expect("rpc");
        assert_eq!(
            reply,
            r#"<rpc-reply message-id="2"><system-uptime-information/></rpc-reply>"#
        );
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let (to_device, _device_rx) = mpsc::channel::<String>(16);
        let (_device_tx, from_device) = mpsc::channel::<String>(16);
        let mut session = NetconfSession::new(to_device, from_device, "[r1]");
        let err = session
            .rpc("<get-system-uptime-information/>", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RpcTimeout(_)));
    }

    #[tokio::test]
    async fn closed_pipe_reports_session_closed() {
        let (to_device, _device_rx) = mpsc::channel::<String>(16);
        let (device_tx, from_device) = mpsc::channel::<String>(16);
        drop(device_tx);
        let mut session = NetconfSession::new(to_device, from_device, "[r1]");
        let err = session
            .rpc("<request-reboot/>", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::SessionClosed(_)));
    }
}
