//! KATCP client.
//!
//! This module implements the subset of the KATCP protocol used to control a
//! ROACH board: register and memory access, device listing, and programming
//! of bitstreams. Each request is bounded by a timeout.

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

/// Default KATCP port of a ROACH.
pub const DEFAULT_PORT: u16 = 7147;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRAM_TIMEOUT: Duration = Duration::from_secs(60);
// port on which the ROACH listens for the bitstream during progremote
const UPLOAD_PORT: u16 = 3000;

/// KATCP message type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    /// Request (`?`).
    Request,
    /// Reply (`!`).
    Reply,
    /// Inform (`#`).
    Inform,
}

/// KATCP message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    /// Message type.
    pub kind: MessageKind,
    /// Message name.
    pub name: String,
    /// Unescaped arguments.
    pub args: Vec<Bytes>,
}

impl Message {
    /// Creates a request.
    pub fn request(name: &str, args: &[&[u8]]) -> Message {
        Message {
            kind: MessageKind::Request,
            name: name.to_string(),
            args: args.iter().map(|a| Bytes::copy_from_slice(a)).collect(),
        }
    }

    /// Encodes the message as a line terminated by `\n`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(match self.kind {
            MessageKind::Request => b'?',
            MessageKind::Reply => b'!',
            MessageKind::Inform => b'#',
        });
        buf.put_slice(self.name.as_bytes());
        for arg in &self.args {
            buf.put_u8(b' ');
            escape(arg, &mut buf);
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }

    /// Parses a line (without the line terminator).
    pub fn parse(line: &[u8]) -> Result<Message, String> {
        let mut tokens = line
            .split(|&c| c == b' ' || c == b'\t')
            .filter(|t| !t.is_empty());
        let head = tokens.next().ok_or("empty message")?;
        let kind = match head[0] {
            b'?' => MessageKind::Request,
            b'!' => MessageKind::Reply,
            b'#' => MessageKind::Inform,
            c => return Err(format!("invalid message type {:?}", c as char)),
        };
        let mut name = std::str::from_utf8(&head[1..])
            .map_err(|_| "message name is not UTF-8")?
            .to_string();
        // strip message id
        if let Some(pos) = name.find('[') {
            name.truncate(pos);
        }
        if name.is_empty() {
            return Err("empty message name".to_string());
        }
        let args = tokens.map(unescape).collect::<Result<Vec<_>, _>>()?;
        Ok(Message { kind, name, args })
    }

    /// Returns `true` if the message is a successful reply.
    pub fn is_ok(&self) -> bool {
        self.kind == MessageKind::Reply && self.args.first().map(|a| &a[..]) == Some(&b"ok"[..])
    }

    fn arg_str(&self, n: usize) -> Option<&str> {
        self.args.get(n).and_then(|a| std::str::from_utf8(a).ok())
    }
}

/// Escapes a KATCP argument.
pub fn escape(arg: &[u8], buf: &mut BytesMut) {
    if arg.is_empty() {
        buf.put_slice(b"\\@");
        return;
    }
    for &c in arg {
        match c {
            b'\\' => buf.put_slice(b"\\\\"),
            b' ' => buf.put_slice(b"\\_"),
            0 => buf.put_slice(b"\\0"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            0x1b => buf.put_slice(b"\\e"),
            b'\t' => buf.put_slice(b"\\t"),
            c => buf.put_u8(c),
        }
    }
}

/// Unescapes a KATCP argument.
pub fn unescape(arg: &[u8]) -> Result<Bytes, String> {
    if arg == b"\\@" {
        return Ok(Bytes::new());
    }
    let mut out = BytesMut::with_capacity(arg.len());
    let mut iter = arg.iter();
    while let Some(&c) = iter.next() {
        if c != b'\\' {
            out.put_u8(c);
            continue;
        }
        let escaped = match iter.next() {
            Some(b'\\') => b'\\',
            Some(b'_') => b' ',
            Some(b'0') => 0,
            Some(b'n') => b'\n',
            Some(b'r') => b'\r',
            Some(b'e') => 0x1b,
            Some(b't') => b'\t',
            Some(&c) => return Err(format!("invalid escape sequence \\{}", c as char)),
            None => return Err("unterminated escape sequence".to_string()),
        };
        out.put_u8(escaped);
    }
    Ok(out.freeze())
}

#[derive(Debug)]
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(host: &str, port: u16) -> Result<Connection, Error> {
        let target = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(format!("connection to {target}")))?
            .map_err(|e| Error::transport(&target, e))?;
        // KATCP requests are short; do not delay them
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport(&target, e))?;
        let (reader, writer) = stream.into_split();
        tracing::info!(%target, "connected to KATCP server");
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

/// KATCP client.
///
/// The client owns a TCP connection to the KATCP server of the ROACH and
/// performs one request at a time. A request that times out or fails at the
/// transport level drops the connection, since a late reply would otherwise
/// be taken as the answer to the next request. The connection is reopened
/// before the next request.
#[derive(Debug)]
pub struct KatcpClient {
    host: String,
    port: u16,
    connection: Option<Connection>,
}

impl KatcpClient {
    /// Connects to a KATCP server.
    #[tracing::instrument(name = "KatcpClient::connect", level = "debug")]
    pub async fn connect(host: &str, port: u16) -> Result<KatcpClient, Error> {
        let connection = Connection::open(host, port).await?;
        Ok(KatcpClient {
            host: host.to_string(),
            port,
            connection: Some(connection),
        })
    }

    /// Returns `true` if the connection has not failed since the last request.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            tracing::warn!(target = %self.target(), "dropping KATCP connection");
        }
    }

    async fn connection(&mut self) -> Result<&mut Connection, Error> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => Connection::open(&self.host, self.port).await?,
        };
        Ok(self.connection.insert(connection))
    }

    async fn send(&mut self, request: &Message) -> Result<(), Error> {
        let line = request.encode();
        tracing::trace!(request = %String::from_utf8_lossy(&line[..line.len().min(80)]), "KATCP send");
        let target = self.target();
        let connection = self.connection().await?;
        let result = connection.writer.write_all(&line).await;
        result.map_err(|e| Error::transport(target, e))
    }

    async fn receive(&mut self) -> Result<Message, Error> {
        let target = self.target();
        let connection = self.connection().await?;
        let mut line = Vec::new();
        match connection.reader.read_until(b'\n', &mut line).await {
            Ok(0) => Err(Error::Transport {
                target,
                reason: "connection closed".to_string(),
            }),
            Ok(_) => {
                while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                    line.pop();
                }
                Message::parse(&line).map_err(|reason| Error::Transport { target, reason })
            }
            Err(e) => Err(Error::transport(target, e)),
        }
    }

    /// Waits for the reply to the request `name`.
    ///
    /// The informs with the same name received before the reply are returned
    /// together with the reply. Other informs are logged.
    async fn reply(&mut self, name: &str) -> Result<(Message, Vec<Message>), Error> {
        let mut informs = Vec::new();
        loop {
            let message = self.receive().await?;
            match message.kind {
                MessageKind::Reply if message.name == name => return Ok((message, informs)),
                MessageKind::Inform if message.name == name => informs.push(message),
                _ => tracing::debug!(name = %message.name, "unsolicited KATCP message"),
            }
        }
    }

    /// Waits for the reply to `name` for at most `timeout`.
    ///
    /// On a timeout or a transport error the connection is dropped.
    async fn reply_within(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<(Message, Vec<Message>), Error> {
        let target = self.target();
        let reply = tokio::time::timeout(timeout, self.reply(name)).await;
        match reply {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                self.disconnect();
                Err(Error::Timeout(format!("KATCP {name} on {target}")))
            }
        }
    }

    /// Performs a request and waits for the reply.
    ///
    /// A reply other than `ok` is an [`Error::Transport`].
    pub async fn request(
        &mut self,
        name: &str,
        args: &[&[u8]],
        timeout: Duration,
    ) -> Result<(Message, Vec<Message>), Error> {
        let request = Message::request(name, args);
        let target = self.target();
        if let Err(e) = self.send(&request).await {
            self.disconnect();
            return Err(e);
        }
        let (reply, informs) = self.reply_within(name, timeout).await?;
        if !reply.is_ok() {
            let reason = reply
                .args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            return Err(Error::Transport {
                target,
                reason: format!("{name} failed: {reason}"),
            });
        }
        Ok((reply, informs))
    }

    /// Reads a 32-bit register.
    pub async fn wordread(&mut self, name: &str) -> Result<u32, Error> {
        let (reply, _) = self
            .request("wordread", &[name.as_bytes(), b"0"], REQUEST_TIMEOUT)
            .await?;
        let value = reply.arg_str(1).unwrap_or_default();
        let digits = value.trim_start_matches("0x");
        u32::from_str_radix(digits, 16).map_err(|_| Error::Transport {
            target: self.target(),
            reason: format!("invalid wordread reply {value:?} for {name}"),
        })
    }

    /// Writes a 32-bit register.
    pub async fn wordwrite(&mut self, name: &str, value: u32) -> Result<(), Error> {
        let value = format!("0x{value:08x}");
        self.request(
            "wordwrite",
            &[name.as_bytes(), b"0", value.as_bytes()],
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Reads `len` bytes from a device starting at `offset`.
    pub async fn read(&mut self, name: &str, offset: usize, len: usize) -> Result<Bytes, Error> {
        let offset = offset.to_string();
        let len_arg = len.to_string();
        let (reply, _) = self
            .request(
                "read",
                &[name.as_bytes(), offset.as_bytes(), len_arg.as_bytes()],
                REQUEST_TIMEOUT,
            )
            .await?;
        let data = reply.args.get(1).cloned().unwrap_or_default();
        if data.len() != len {
            return Err(Error::Transport {
                target: self.target(),
                reason: format!("read of {name} returned {} bytes, expected {len}", data.len()),
            });
        }
        Ok(data)
    }

    /// Writes bytes to a device starting at `offset`.
    pub async fn write(&mut self, name: &str, offset: usize, data: &[u8]) -> Result<(), Error> {
        let offset = offset.to_string();
        self.request(
            "write",
            &[name.as_bytes(), offset.as_bytes(), data],
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Lists the registers and memories of the running design.
    pub async fn listdev(&mut self) -> Result<Vec<String>, Error> {
        let (_, informs) = self.request("listdev", &[], REQUEST_TIMEOUT).await?;
        Ok(informs
            .iter()
            .filter_map(|m| m.arg_str(0).map(str::to_string))
            .collect())
    }

    /// Programs a bitstream stored on the ROACH.
    pub async fn progdev(&mut self, boffile: &str) -> Result<(), Error> {
        self.request("progdev", &[boffile.as_bytes()], PROGRAM_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Uploads a bitstream to the ROACH RAM and programs it.
    ///
    /// The ROACH opens a port on which the bitstream is streamed over a second
    /// TCP connection. The reply arrives once programming has finished.
    pub async fn progremote(&mut self, bitstream: &[u8]) -> Result<(), Error> {
        let port = UPLOAD_PORT.to_string();
        if let Err(e) = self
            .send(&Message::request("progremote", &[port.as_bytes()]))
            .await
        {
            self.disconnect();
            return Err(e);
        }
        let host = self.host.clone();
        let upload_target = format!("{host}:{UPLOAD_PORT}");
        let upload = async {
            // give the ROACH time to open the upload port
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut stream = TcpStream::connect((host.as_str(), UPLOAD_PORT))
                .await
                .map_err(|e| Error::transport(&upload_target, e))?;
            stream
                .write_all(bitstream)
                .await
                .map_err(|e| Error::transport(&upload_target, e))?;
            stream
                .shutdown()
                .await
                .map_err(|e| Error::transport(&upload_target, e))
        };
        let uploaded = tokio::time::timeout(PROGRAM_TIMEOUT, upload)
            .await
            .map_err(|_| Error::Timeout(format!("bitstream upload to {upload_target}")))
            .and_then(|result| result);
        if let Err(e) = uploaded {
            // the progremote reply is still pending on the connection
            self.disconnect();
            return Err(e);
        }
        let target = self.target();
        let (reply, _) = self.reply_within("progremote", PROGRAM_TIMEOUT).await?;
        if !reply.is_ok() {
            return Err(Error::Transport {
                target,
                reason: "progremote failed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn escaping() {
        let raw: &[u8] = b"a b\\c\0\n\r\x1b\td";
        let mut buf = BytesMut::new();
        escape(raw, &mut buf);
        assert_eq!(&buf[..], b"a\\_b\\\\c\\0\\n\\r\\e\\td");
        assert_eq!(&unescape(&buf).unwrap()[..], raw);
        let mut buf = BytesMut::new();
        escape(b"", &mut buf);
        assert_eq!(&buf[..], b"\\@");
        assert!(unescape(b"\\@").unwrap().is_empty());
        assert!(unescape(b"ab\\").is_err());
        assert!(unescape(b"\\q").is_err());
    }

    #[test]
    fn parse_messages() {
        let m = Message::parse(b"!wordread ok 0x0000000a").unwrap();
        assert_eq!(m.kind, MessageKind::Reply);
        assert_eq!(m.name, "wordread");
        assert!(m.is_ok());
        assert_eq!(m.arg_str(1), Some("0x0000000a"));
        let m = Message::parse(b"#listdev[3]  acc_len").unwrap();
        assert_eq!(m.kind, MessageKind::Inform);
        assert_eq!(m.name, "listdev");
        assert_eq!(m.arg_str(0), Some("acc_len"));
        let m = Message::parse(b"!progdev fail no\\_such\\_file").unwrap();
        assert!(!m.is_ok());
        assert_eq!(m.arg_str(1), Some("no such file"));
        assert!(Message::parse(b"").is_err());
        assert!(Message::parse(b"*x").is_err());
    }

    #[test]
    fn encode_request() {
        let m = Message::request("write", &[b"coeffs", b"0", b"\x00 \x01"]);
        assert_eq!(&m.encode()[..], b"?write coeffs 0 \\0\\_\x01\n");
    }

    // Minimal KATCP server holding a single register and a single memory.
    async fn serve(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut reg = 0u32;
        let mut mem = vec![0u8; 16];
        loop {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line).await.unwrap() == 0 {
                return;
            }
            line.pop();
            let request = Message::parse(&line).unwrap();
            let arg = |n: usize| String::from_utf8(request.args[n].to_vec()).unwrap();
            let reply: Vec<Message> = match request.name.as_str() {
                "listdev" => vec![
                    Message {
                        kind: MessageKind::Inform,
                        name: "listdev".into(),
                        args: vec![Bytes::from_static(b"acc_len")],
                    },
                    Message {
                        kind: MessageKind::Inform,
                        name: "log".into(),
                        args: vec![Bytes::from_static(b"info")],
                    },
                    Message {
                        kind: MessageKind::Inform,
                        name: "listdev".into(),
                        args: vec![Bytes::from_static(b"dout")],
                    },
                    Message {
                        kind: MessageKind::Reply,
                        name: "listdev".into(),
                        args: vec![Bytes::from_static(b"ok"), Bytes::from_static(b"2")],
                    },
                ],
                "wordwrite" if arg(0) == "acc_len" => {
                    reg = u32::from_str_radix(arg(2).trim_start_matches("0x"), 16).unwrap();
                    vec![Message {
                        kind: MessageKind::Reply,
                        name: "wordwrite".into(),
                        args: vec![Bytes::from_static(b"ok")],
                    }]
                }
                "wordread" if arg(0) == "acc_len" => vec![Message {
                    kind: MessageKind::Reply,
                    name: "wordread".into(),
                    args: vec![
                        Bytes::from_static(b"ok"),
                        Bytes::from(format!("0x{reg:08x}")),
                    ],
                }],
                "write" if arg(0) == "dout" => {
                    let offset: usize = arg(1).parse().unwrap();
                    let data = &request.args[2];
                    mem[offset..offset + data.len()].copy_from_slice(data);
                    vec![Message {
                        kind: MessageKind::Reply,
                        name: "write".into(),
                        args: vec![Bytes::from_static(b"ok")],
                    }]
                }
                "read" if arg(0) == "dout" => {
                    let offset: usize = arg(1).parse().unwrap();
                    let len: usize = arg(2).parse().unwrap();
                    vec![Message {
                        kind: MessageKind::Reply,
                        name: "read".into(),
                        args: vec![
                            Bytes::from_static(b"ok"),
                            Bytes::copy_from_slice(&mem[offset..offset + len]),
                        ],
                    }]
                }
                name => vec![Message {
                    kind: MessageKind::Reply,
                    name: name.to_string(),
                    args: vec![Bytes::from_static(b"fail"), Bytes::from_static(b"unknown")],
                }],
            };
            for message in reply {
                writer.write_all(&message.encode()).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn client_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener));
        let mut client = KatcpClient::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(client.listdev().await.unwrap(), vec!["acc_len", "dout"]);
        client.wordwrite("acc_len", 0x1234).await.unwrap();
        assert_eq!(client.wordread("acc_len").await.unwrap(), 0x1234);
        // bytes that need escaping
        let data = [0u8, b' ', b'\\', b'\n', 0xff, 0x1b, b'\t', b'\r'];
        client.write("dout", 4, &data).await.unwrap();
        assert_eq!(&client.read("dout", 4, 8).await.unwrap()[..], &data);
        let err = client.wordread("missing").await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(client.is_connected());
    }

    // Register server that holds back its first reply.
    async fn serve_slowly(listener: TcpListener) {
        let mut first = true;
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let delay = if first {
                Duration::from_millis(500)
            } else {
                Duration::ZERO
            };
            first = false;
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut delay = delay;
                loop {
                    let mut line = Vec::new();
                    if reader.read_until(b'\n', &mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    line.pop();
                    let request = Message::parse(&line).unwrap();
                    let value: &[u8] = match &request.args[0][..] {
                        b"reg_a" => b"0x000000aa",
                        _ => b"0x000000bb",
                    };
                    tokio::time::sleep(delay).await;
                    delay = Duration::ZERO;
                    let reply = Message {
                        kind: MessageKind::Reply,
                        name: request.name,
                        args: vec![Bytes::from_static(b"ok"), Bytes::copy_from_slice(value)],
                    };
                    if writer.write_all(&reply.encode()).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_next_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_slowly(listener));
        let mut client = KatcpClient::connect("127.0.0.1", port).await.unwrap();
        let err = client
            .request("wordread", &[b"reg_a", b"0"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!client.is_connected());
        // let the late reply reach the old connection
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(client.wordread("reg_b").await.unwrap(), 0xbb);
        assert!(client.is_connected());
        assert_eq!(client.wordread("reg_a").await.unwrap(), 0xaa);
    }

    #[tokio::test]
    async fn connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(KatcpClient::connect("127.0.0.1", port).await.is_err());
    }
}
