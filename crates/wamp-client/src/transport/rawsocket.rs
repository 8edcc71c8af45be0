//! WAMP RawSocket backend over TCP.
//!
//! Handshake (both directions): `[0x7F][LLLL SSSS][0x00][0x00]` where `LLLL`
//! is the maximum message length exponent (`2^(9 + L)` bytes) and `SSSS` the
//! serializer. A router refusing the connection answers with `SSSS = 0` and
//! an error code in `LLLL`.
//!
//! Frame format: `[0000 0TTT][24-bit length BE][payload]`
//!
//! Frame types:
//! - `0`: regular WAMP message
//! - `1`: ping (answered with a pong carrying the same payload)
//! - `2`: pong

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use wamp_core::transport::BoxFuture;
use wamp_core::{Connector, FrameSink, FrameSource, Link, Message, WampError, WampResult};

use super::Serializer;

const MAGIC: u8 = 0x7F;

const FRAME_REGULAR: u8 = 0;
const FRAME_PING: u8 = 1;
const FRAME_PONG: u8 = 2;

/// Largest length exponent, announcing 16 MiB.
pub const MAX_LENGTH_EXPONENT: u8 = 15;

/// A 24-bit length field caps payloads one byte short of 16 MiB.
const MAX_FRAME_LEN: usize = 0x00FF_FFFF;

fn max_len(exponent: u8) -> usize {
    (1usize << (9 + exponent as usize)).min(MAX_FRAME_LEN)
}

fn handshake_request(exponent: u8, serializer: Serializer) -> [u8; 4] {
    [MAGIC, (exponent << 4) | serializer.rawsocket_id(), 0, 0]
}

/// Validate the router's handshake reply; returns the peer's maximum message length.
fn parse_handshake_reply(reply: [u8; 4], serializer: Serializer) -> WampResult<usize> {
    if reply[0] != MAGIC {
        return Err(WampError::Connection(format!(
            "not a WAMP RawSocket peer (magic 0x{:02x})",
            reply[0]
        )));
    }
    let high = reply[1] >> 4;
    let low = reply[1] & 0x0F;
    if low == 0 {
        let reason = match high {
            1 => "serializer unsupported",
            2 => "maximum message length unacceptable",
            3 => "use of reserved bits",
            4 => "maximum connection count reached",
            _ => "unknown error",
        };
        return Err(WampError::Connection(format!(
            "router rejected handshake: {reason}"
        )));
    }
    if low != serializer.rawsocket_id() {
        return Err(WampError::Connection(format!(
            "router answered with serializer {low}, requested {}",
            serializer.rawsocket_id()
        )));
    }
    if reply[2] != 0 || reply[3] != 0 {
        return Err(WampError::Connection("reserved handshake bytes are set".into()));
    }
    Ok(max_len(high))
}

fn frame_header(frame_type: u8, len: usize) -> [u8; 4] {
    [frame_type, (len >> 16) as u8, (len >> 8) as u8, len as u8]
}

fn parse_frame_header(header: [u8; 4]) -> (u8, usize) {
    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    (header[0] & 0x07, len)
}

async fn write_frame(
    half: &Mutex<OwnedWriteHalf>,
    frame_type: u8,
    payload: &[u8],
) -> WampResult<()> {
    let header = frame_header(frame_type, payload.len());
    let mut half = half.lock().await;
    half.write_all(&header).await?;
    half.write_all(payload).await?;
    Ok(())
}

/// Connects to a router's RawSocket listener.
pub struct RawSocketConnector {
    addr: String,
    serializer: Serializer,
    length_exponent: u8,
}

impl RawSocketConnector {
    pub fn new(addr: impl Into<String>, serializer: Serializer) -> Self {
        Self {
            addr: addr.into(),
            serializer,
            length_exponent: MAX_LENGTH_EXPONENT,
        }
    }

    /// Announce a smaller maximum message length of `2^(9 + exponent)` bytes.
    pub fn with_length_exponent(mut self, exponent: u8) -> Self {
        self.length_exponent = exponent.min(MAX_LENGTH_EXPONENT);
        self
    }
}

impl Connector for RawSocketConnector {
    fn connect(&self) -> BoxFuture<'_, WampResult<Link>> {
        Box::pin(async move {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| WampError::Connection(format!("{}: {e}", self.addr)))?;
            stream.set_nodelay(true)?;

            stream
                .write_all(&handshake_request(self.length_exponent, self.serializer))
                .await?;
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.map_err(|e| {
                WampError::Connection(format!("RawSocket handshake failed: {e}"))
            })?;
            let peer_max = parse_handshake_reply(reply, self.serializer)?;

            debug!(addr = %self.addr, peer_max, "RawSocket handshake complete");

            let (read_half, write_half) = stream.into_split();
            let write_half = Arc::new(Mutex::new(write_half));
            Ok(Link::new(
                RawSocketSink {
                    half: write_half.clone(),
                    peer_max,
                },
                RawSocketSource {
                    half: read_half,
                    pong: write_half,
                    max_len: max_len(self.length_exponent),
                },
            ))
        })
    }

    fn describe(&self) -> String {
        format!("rawsocket://{}", self.addr)
    }
}

struct RawSocketSink {
    half: Arc<Mutex<OwnedWriteHalf>>,
    peer_max: usize,
}

impl FrameSink for RawSocketSink {
    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            if message.len() > self.peer_max {
                return Err(WampError::ProtocolViolation(format!(
                    "message of {} bytes exceeds the router's limit of {}",
                    message.len(),
                    self.peer_max
                )));
            }
            write_frame(&self.half, FRAME_REGULAR, message.as_bytes()).await
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            let mut half = self.half.lock().await;
            half.shutdown().await?;
            Ok(())
        })
    }
}

struct RawSocketSource {
    half: OwnedReadHalf,
    pong: Arc<Mutex<OwnedWriteHalf>>,
    max_len: usize,
}

impl FrameSource for RawSocketSource {
    fn recv(&mut self) -> BoxFuture<'_, WampResult<Option<Message>>> {
        Box::pin(async move {
            loop {
                let mut header = [0u8; 4];
                match self.half.read_exact(&mut header).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                let (frame_type, len) = parse_frame_header(header);
                if len > self.max_len {
                    return Err(WampError::ProtocolViolation(format!(
                        "incoming frame of {len} bytes exceeds limit of {}",
                        self.max_len
                    )));
                }
                let mut payload = vec![0u8; len];
                self.half.read_exact(&mut payload).await?;

                match frame_type {
                    FRAME_REGULAR => return Ok(Some(Message::from(payload))),
                    FRAME_PING => {
                        trace!(len, "answering RawSocket ping");
                        write_frame(&self.pong, FRAME_PONG, &payload).await?;
                    }
                    FRAME_PONG => trace!(len, "RawSocket pong"),
                    other => {
                        return Err(WampError::ProtocolViolation(format!(
                            "unknown RawSocket frame type {other}"
                        )))
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal router side: accept, answer the handshake, then hand back the socket.
    async fn fake_router(reply: [u8; 4]) -> (String, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 4];
            socket.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello[0], MAGIC);
            socket.write_all(&reply).await.unwrap();
            socket
        });
        (addr, handle)
    }

    #[test]
    fn handshake_encoding() {
        assert_eq!(handshake_request(15, Serializer::Json), [0x7F, 0xF1, 0, 0]);
        assert_eq!(handshake_request(0, Serializer::MsgPack), [0x7F, 0x02, 0, 0]);
    }

    #[test]
    fn handshake_reply_parsing() {
        assert_eq!(
            parse_handshake_reply([0x7F, 0xF1, 0, 0], Serializer::Json).unwrap(),
            MAX_FRAME_LEN
        );
        assert_eq!(
            parse_handshake_reply([0x7F, 0x01, 0, 0], Serializer::Json).unwrap(),
            512
        );
        assert!(parse_handshake_reply([0x7F, 0x10, 0, 0], Serializer::Json).is_err());
        assert!(parse_handshake_reply([0x7F, 0xF2, 0, 0], Serializer::Json).is_err());
        assert!(parse_handshake_reply([0x00, 0xF1, 0, 0], Serializer::Json).is_err());
    }

    #[test]
    fn frame_header_layout() {
        let header = frame_header(FRAME_REGULAR, 0x010203);
        assert_eq!(header, [0, 1, 2, 3]);
        assert_eq!(parse_frame_header(header), (FRAME_REGULAR, 0x010203));
        assert_eq!(parse_frame_header([0xF9, 0, 0, 5]), (FRAME_PING, 5));
    }

    #[tokio::test]
    async fn exchanges_frames_and_answers_ping() {
        let (addr, router) = fake_router([0x7F, 0xF1, 0, 0]).await;
        let connector = RawSocketConnector::new(addr, Serializer::Json);
        let mut link = connector.connect().await.unwrap();
        let mut socket = router.await.unwrap();

        link.sink.send(Message::from("[1]")).await.unwrap();
        let mut frame = [0u8; 7];
        socket.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"\x00\x00\x00\x03[1]");

        socket.write_all(b"\x01\x00\x00\x02hi").await.unwrap();
        socket.write_all(b"\x00\x00\x00\x03[2]").await.unwrap();
        let got = link.source.recv().await.unwrap().unwrap();
        assert_eq!(got.as_bytes(), b"[2]");

        let mut pong = [0u8; 6];
        socket.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"\x02\x00\x00\x02hi");

        drop(socket);
        assert!(link.source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_handshake_is_a_connection_error() {
        let (addr, _router) = fake_router([0x7F, 0x40, 0, 0]).await;
        let connector = RawSocketConnector::new(addr, Serializer::Json);
        match connector.connect().await {
            Err(WampError::Connection(reason)) => {
                assert!(reason.contains("maximum connection count"))
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("handshake should have been rejected"),
        }
    }

    #[tokio::test]
    async fn announces_configured_length_and_enforces_it_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let router = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 4];
            socket.read_exact(&mut hello).await.unwrap();
            socket.write_all(&[0x7F, 0xF1, 0, 0]).await.unwrap();
            (hello, socket)
        });

        let connector = RawSocketConnector::new(addr, Serializer::Json).with_length_exponent(0);
        let mut link = connector.connect().await.unwrap();
        let (hello, mut socket) = router.await.unwrap();
        assert_eq!(hello, [0x7F, 0x01, 0, 0]);

        // 513 bytes exceeds the announced 512-byte limit.
        socket.write_all(&frame_header(FRAME_REGULAR, 513)).await.unwrap();
        assert!(matches!(
            link.source.recv().await,
            Err(WampError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn length_exponent_is_capped() {
        let connector = RawSocketConnector::new("127.0.0.1:1", Serializer::Json)
            .with_length_exponent(200);
        assert_eq!(connector.length_exponent, MAX_LENGTH_EXPONENT);
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let (addr, _router) = fake_router([0x7F, 0x01, 0, 0]).await;
        let connector = RawSocketConnector::new(addr, Serializer::Json);
        let mut link = connector.connect().await.unwrap();
        let big = Message::from(vec![b'x'; 513]);
        assert!(matches!(
            link.sink.send(big).await,
            Err(WampError::ProtocolViolation(_))
        ));
    }
}
