//! WebSocket backend.
//!
//! Negotiates the `wamp.2.json` or `wamp.2.msgpack` subprotocol. JSON
//! messages travel as text frames, MessagePack as binary frames; either kind
//! is accepted on receive. Pings are answered from the read side.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use wamp_core::transport::BoxFuture;
use wamp_core::{Connector, FrameSink, FrameSource, Link, Message, WampError, WampResult};

use super::Serializer;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

/// Connects to a router's WebSocket endpoint.
pub struct WebSocketConnector {
    url: String,
    serializer: Serializer,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, serializer: Serializer) -> Self {
        Self {
            url: url.into(),
            serializer,
        }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'_, WampResult<Link>> {
        Box::pin(async move {
            let mut request = self
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| WampError::Connection(format!("invalid URL {}: {e}", self.url)))?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(self.serializer.subprotocol()),
            );

            let (ws_stream, _response) = connect_async(request)
                .await
                .map_err(|e| WampError::Connection(format!("WebSocket connect error: {e}")))?;

            debug!(url = %self.url, subprotocol = self.serializer.subprotocol(), "WebSocket connected");

            let (ws_sink, ws_read) = ws_stream.split();
            let ws_sink = Arc::new(Mutex::new(ws_sink));
            Ok(Link::new(
                WebSocketSink {
                    sink: ws_sink.clone(),
                    binary: self.serializer == Serializer::MsgPack,
                },
                WebSocketSource {
                    stream: ws_read,
                    sink: ws_sink,
                },
            ))
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketSink {
    sink: WsSink,
    binary: bool,
}

impl FrameSink for WebSocketSink {
    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            let frame = if self.binary {
                WsMessage::Binary(message.into_bytes())
            } else {
                let text = String::from_utf8(message.into_bytes()).map_err(|_| {
                    WampError::ProtocolViolation("JSON message is not valid UTF-8".into())
                })?;
                WsMessage::Text(text)
            };
            let mut sink = self.sink.lock().await;
            sink.send(frame)
                .await
                .map_err(|e| WampError::Transport(format!("WS write error: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.close()
                .await
                .map_err(|e| WampError::Transport(format!("WS close error: {e}")))
        })
    }
}

struct WebSocketSource {
    stream: SplitStream<WsStream>,
    sink: WsSink,
}

impl FrameSource for WebSocketSource {
    fn recv(&mut self) -> BoxFuture<'_, WampResult<Option<Message>>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => return Ok(Some(Message::from(text))),
                    Ok(WsMessage::Binary(data)) => return Ok(Some(Message::from(data))),
                    Ok(WsMessage::Ping(payload)) => {
                        trace!("answering WebSocket ping");
                        let mut sink = self.sink.lock().await;
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(WsMessage::Close(_)) => {
                        debug!("WebSocket close frame received");
                        return Ok(None);
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(WampError::Transport(format!("WebSocket read error: {e}")))
                    }
                }
            }
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accept one client, agree to `wamp.2.json`, and echo frames back.
    async fn echo_router() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                assert_eq!(
                    req.headers().get("Sec-WebSocket-Protocol").unwrap(),
                    "wamp.2.json"
                );
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static("wamp.2.json"),
                );
                Ok(resp)
            };
            let mut ws = accept_hdr_async(socket, callback).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_text() || frame.is_binary() {
                    ws.send(frame).await.unwrap();
                }
            }
        });
        format!("ws://{addr}/ws")
    }

    #[tokio::test]
    async fn echoes_text_frames() {
        let url = echo_router().await;
        let connector = WebSocketConnector::new(url, Serializer::Json);
        let mut link = connector.connect().await.unwrap();

        link.sink.send(Message::from(r#"[1,"realm1",{}]"#)).await.unwrap();
        let echoed = link.source.recv().await.unwrap().unwrap();
        assert_eq!(echoed.as_bytes(), br#"[1,"realm1",{}]"#);

        let _ = link.sink.close().await;
    }

    #[tokio::test]
    async fn json_requires_utf8() {
        let url = echo_router().await;
        let connector = WebSocketConnector::new(url, Serializer::Json);
        let mut link = connector.connect().await.unwrap();
        let err = link.sink.send(Message::from(vec![0xFF, 0xFE])).await.unwrap_err();
        assert!(matches!(err, WampError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn unreachable_router_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = WebSocketConnector::new(format!("ws://{addr}/ws"), Serializer::Json);
        assert!(matches!(
            connector.connect().await,
            Err(WampError::Connection(_))
        ));
    }
}
