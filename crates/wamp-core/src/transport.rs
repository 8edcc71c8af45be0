//! Abstract transport contracts for the WAMP channel.
//!
//! A WAMP transport is message based, bidirectional, reliable and ordered.
//! [`Transport`] is the surface the session layer drives; [`TransportHandler`]
//! is what the transport calls back into; [`Connector`], [`FrameSink`] and
//! [`FrameSource`] are the byte-level backend a transport runs on.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::deferred::Deferred;
use crate::error::{WampError, WampResult};
use crate::message::Message;

/// Boxed future used by the object-safe backend traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback fired on send-side congestion changes.
pub type FlowHandler = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a transport's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Consumer of transport events, normally the session.
///
/// The transport keeps only a weak reference to its handler. Callbacks run
/// on the transport's dispatch task and must not block.
pub trait TransportHandler: Send + Sync {
    /// A message arrived from the peer.
    fn on_message(&self, message: Message);

    /// The connection went away after it had been established.
    fn on_connection_lost(&self, reason: &WampError);

    /// Called once the handler has been bound.
    fn on_attach(&self) {}

    /// Called after the handler has been unbound and no delivery is in flight.
    fn on_detach(&self) {}
}

/// A flow-controlled, message-oriented channel to one peer.
pub trait Transport: Send + Sync {
    /// Start connecting. Resolves once the connection is up or has failed.
    fn connect(&self) -> Deferred;

    /// Start an orderly shutdown. Resolves once teardown has finished.
    fn disconnect(&self) -> Deferred;

    fn state(&self) -> ConnectionState;

    /// Whether the transport is in [`ConnectionState::Connected`].
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a message for transmission, preserving submission order.
    fn send_message(&self, message: Message) -> WampResult<()>;

    /// Replace the callback fired when outbound congestion begins.
    fn set_pause_handler(&self, handler: FlowHandler);

    /// Replace the callback fired when outbound congestion clears.
    fn set_resume_handler(&self, handler: FlowHandler);

    /// Stop delivering incoming messages to the handler.
    fn pause(&self);

    /// Resume delivering incoming messages, starting with any buffered ones.
    fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Whether the outbound queue is currently above its high watermark.
    fn is_congested(&self) -> bool;

    /// Bind a handler. Fails with [`WampError::HandlerConflict`] if one is bound.
    fn attach(&self, handler: &Arc<dyn TransportHandler>) -> WampResult<()>;

    /// Unbind the current handler, if any.
    fn detach(&self);

    fn has_handler(&self) -> bool;
}

/// Write half of an established backend connection.
pub trait FrameSink: Send {
    /// Transmit one message.
    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>>;

    /// Close the write half gracefully.
    fn close(&mut self) -> BoxFuture<'_, WampResult<()>>;
}

/// Read half of an established backend connection.
pub trait FrameSource: Send {
    /// Receive the next message. `Ok(None)` means the peer closed cleanly.
    fn recv(&mut self) -> BoxFuture<'_, WampResult<Option<Message>>>;
}

/// Both halves of a backend connection.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Link {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Establishes backend connections (TCP, WebSocket, in-process, ...).
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, WampResult<Link>>;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}
