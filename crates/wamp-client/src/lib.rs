//! wamp-client: Flow-controlled transports for a WAMP client.
//!
//! [`FlowTransport`] implements the [`wamp_core::Transport`] contract over
//! any backend [`wamp_core::Connector`]: connection lifecycle, ordered
//! outbound queueing with congestion signals, inbound pause/resume with
//! buffering, and single-handler attachment. Backends are provided for
//! WAMP RawSocket over TCP, WebSocket, and an in-process loopback.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wamp_client::{connector_for, FlowTransport, Serializer, TransportConfig};
//! use wamp_core::{Message, Transport, TransportHandler, WampError};
//!
//! struct Printer;
//!
//! impl TransportHandler for Printer {
//!     fn on_message(&self, message: Message) {
//!         println!("{}", String::from_utf8_lossy(message.as_bytes()));
//!     }
//!     fn on_connection_lost(&self, reason: &WampError) {
//!         eprintln!("{reason}");
//!     }
//! }
//!
//! # async fn example() -> wamp_core::WampResult<()> {
//! let connector = connector_for("ws://127.0.0.1:8080/ws", Serializer::Json)?;
//! let transport = FlowTransport::new(connector, TransportConfig::default())?;
//!
//! let handler: Arc<dyn TransportHandler> = Arc::new(Printer);
//! transport.attach(&handler)?;
//! transport.connect().await?;
//! transport.send_message(Message::from(r#"[1, "realm1", {}]"#))?;
//!
//! transport.disconnect().await?;
//! transport.detach();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod transport;

// Re-export primary public types.
pub use auth::{ChallengeExtra, CraCredentials};
pub use config::TransportConfig;
pub use transport::{
    connector_for, detect_transport, loopback, FlowTransport, LoopbackConnector,
    LoopbackListener, LoopbackPeer, RawSocketConnector, Serializer, TransportKind,
    WebSocketConnector,
};

// Re-export wamp-core error types for convenience.
pub use wamp_core::{WampError, WampResult};
