//! Flow-controlled transport over a pluggable backend.
//!
//! Each connection runs three tasks on the transport's runtime:
//! - a reader pulling frames off the backend into a bounded channel,
//! - a writer draining the ordered outbound queue into the backend,
//! - a dispatcher, the only context that calls the attached handler and the
//!   pause/resume callbacks while the connection is up.
//!
//! Backends are selected from the URL scheme:
//! - `ws://` or `wss://` → WebSocket
//! - `tcp://` or `rs://` → WAMP RawSocket over TCP
//!
//! # Policies
//!
//! - `connect()` is rejected with `ProtocolViolation` unless disconnected.
//! - `disconnect()` resolves immediately when already disconnected, cancels
//!   a pending connect, and joins a disconnect already in progress.
//! - `send_message()` is rejected with `ProtocolViolation` unless connected.
//! - `attach()` is rejected with `HandlerConflict` while a handler is bound.
//!
//! Messages that arrived while inbound delivery was paused are never thrown
//! away when the connection ends. They are held until `resume()`, delivered
//! in order, and only then is a lost connection reported. Messages of a
//! later connection wait behind them.

pub mod loopback;
pub mod rawsocket;
pub mod websocket;

mod flow;
mod slot;

pub use loopback::{loopback, LoopbackConnector, LoopbackListener, LoopbackPeer};
pub use rawsocket::RawSocketConnector;
pub use websocket::WebSocketConnector;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use wamp_core::deferred::{deferred, Deferred, Resolver};
use wamp_core::{
    ConnectionState, Connector, FlowHandler, FrameSink, FrameSource, Link, Message, Transport,
    TransportHandler, WampError, WampResult,
};

use crate::config::TransportConfig;
use flow::{FlowControl, Signal};
use slot::HandlerSlot;

/// Message serialization negotiated with the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    #[default]
    Json,
    MsgPack,
}

impl Serializer {
    /// WebSocket subprotocol name.
    pub fn subprotocol(self) -> &'static str {
        match self {
            Self::Json => "wamp.2.json",
            Self::MsgPack => "wamp.2.msgpack",
        }
    }

    /// Serializer nibble of the RawSocket handshake.
    pub(crate) fn rawsocket_id(self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MsgPack => 2,
        }
    }
}

impl FromStr for Serializer {
    type Err = WampError;

    fn from_str(s: &str) -> WampResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" => Ok(Self::MsgPack),
            other => Err(WampError::Config(format!(
                "unknown serializer '{other}' (expected json or msgpack)"
            ))),
        }
    }
}

/// Backend kind, inferred from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    RawSocket,
}

/// Determine the backend kind from a URL string.
pub fn detect_transport(url: &str) -> WampResult<TransportKind> {
    let lower = url.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(TransportKind::WebSocket)
    } else if lower.starts_with("tcp://") || lower.starts_with("rs://") {
        Ok(TransportKind::RawSocket)
    } else {
        Err(WampError::Config(format!(
            "unsupported URL scheme: {url} (expected ws://, wss://, tcp://, or rs://)"
        )))
    }
}

/// Build a backend connector for `url`.
pub fn connector_for(url: &str, serializer: Serializer) -> WampResult<Arc<dyn Connector>> {
    match detect_transport(url)? {
        TransportKind::WebSocket => Ok(Arc::new(WebSocketConnector::new(url, serializer))),
        TransportKind::RawSocket => {
            let addr = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return Err(WampError::Config(format!("missing host in {url}")));
            }
            Ok(Arc::new(RawSocketConnector::new(addr, serializer)))
        }
    }
}

/// Frames carry the handler epoch current when they came off the backend.
enum Inbound {
    Frame(u64, Message),
    Closed(WampError),
}

type Backlog = VecDeque<(u64, Message)>;

/// Tasks and channels of one established connection.
struct LinkTasks {
    outbound: mpsc::UnboundedSender<Message>,
    signals: mpsc::UnboundedSender<Signal>,
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct PendingConnect {
    resolver: Resolver,
    cancel: oneshot::Sender<()>,
}

struct Lifecycle {
    state: ConnectionState,
    /// Bumped on every connect attempt; stale tasks compare against it.
    generation: u64,
    link: Option<LinkTasks>,
    pending_connect: Option<PendingConnect>,
    disconnect_waiters: Vec<Resolver>,
    /// Delivers what a finished link still held; the next link waits for it.
    draining: Option<JoinHandle<()>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    runtime: Handle,
    life: Mutex<Lifecycle>,
    handler: HandlerSlot,
    flow: FlowControl,
    paused: watch::Sender<bool>,
}

/// A [`Transport`] implementation over any [`Connector`].
pub struct FlowTransport {
    shared: Arc<Shared>,
}

impl FlowTransport {
    /// Create a transport on the current tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> WampResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            WampError::Config("FlowTransport must be created inside a tokio runtime".into())
        })?;
        Self::with_runtime(connector, config, runtime)
    }

    /// Create a transport whose tasks run on `runtime`.
    pub fn with_runtime(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        runtime: Handle,
    ) -> WampResult<Self> {
        config.validate()?;
        let flow = FlowControl::new(config.high_watermark, config.low_watermark);
        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                config,
                runtime,
                life: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                    pending_connect: None,
                    disconnect_waiters: Vec::new(),
                    draining: None,
                }),
                handler: HandlerSlot::default(),
                flow,
                paused: watch::Sender::new(false),
            }),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }
}

impl Transport for FlowTransport {
    fn connect(&self) -> Deferred {
        let (resolver, result) = deferred();
        let (cancel, cancelled) = oneshot::channel();

        let generation = {
            let mut life = self.shared.lock_life();
            if life.state != ConnectionState::Disconnected {
                return Deferred::ready(Err(WampError::ProtocolViolation(format!(
                    "connect() called while {}",
                    life.state
                ))));
            }
            life.state = ConnectionState::Connecting;
            life.generation += 1;
            life.pending_connect = Some(PendingConnect { resolver, cancel });
            life.generation
        };

        debug!(peer = %self.shared.connector.describe(), generation, "connecting");
        let shared = self.shared.clone();
        self.shared
            .runtime
            .spawn(shared.establish(generation, cancelled));
        result
    }

    fn disconnect(&self) -> Deferred {
        let mut life = self.shared.lock_life();
        let state = life.state;
        match state {
            ConnectionState::Disconnected => Deferred::ready(Ok(())),
            ConnectionState::Connecting => {
                life.state = ConnectionState::Disconnected;
                let pending = life.pending_connect.take();
                drop(life);
                debug!("disconnect cancelled a pending connect");
                if let Some(pending) = pending {
                    let _ = pending.cancel.send(());
                    pending.resolver.resolve(Err(WampError::Cancelled));
                }
                Deferred::ready(Ok(()))
            }
            ConnectionState::Disconnecting => {
                let (resolver, result) = deferred();
                life.disconnect_waiters.push(resolver);
                result
            }
            ConnectionState::Connected => {
                let (resolver, result) = deferred();
                life.disconnect_waiters.push(resolver);
                life.state = ConnectionState::Disconnecting;
                let generation = life.generation;
                let link = life.link.take();
                drop(life);

                info!(generation, "disconnecting");
                let shared = self.shared.clone();
                self.shared
                    .runtime
                    .spawn(shared.teardown(generation, link));
                result
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock_life().state
    }

    fn send_message(&self, message: Message) -> WampResult<()> {
        let life = self.shared.lock_life();
        let link = match (life.state, life.link.as_ref()) {
            (ConnectionState::Connected, Some(link)) => link,
            (state, _) => {
                return Err(WampError::ProtocolViolation(format!(
                    "send_message() called while {state}"
                )))
            }
        };

        self.shared.flow.queued(life.generation, &link.signals);
        if link.outbound.send(message).is_err() {
            // The writer has failed; the handler hears about it as a lost connection.
            self.shared.flow.sent(life.generation, &link.signals);
            debug!("writer stopped, dropping outbound message");
            return Ok(());
        }
        trace!(pending = self.shared.flow.pending(), "message queued");
        Ok(())
    }

    fn set_pause_handler(&self, handler: FlowHandler) {
        self.shared.flow.set_pause_handler(handler);
    }

    fn set_resume_handler(&self, handler: FlowHandler) {
        self.shared.flow.set_resume_handler(handler);
    }

    fn pause(&self) {
        if self
            .shared
            .paused
            .send_if_modified(|paused| !std::mem::replace(paused, true))
        {
            debug!("inbound delivery paused");
        }
    }

    fn resume(&self) {
        if self
            .shared
            .paused
            .send_if_modified(|paused| std::mem::replace(paused, false))
        {
            debug!("inbound delivery resumed");
        }
    }

    fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    fn is_congested(&self) -> bool {
        self.shared.flow.is_congested()
    }

    fn attach(&self, handler: &Arc<dyn TransportHandler>) -> WampResult<()> {
        self.shared.handler.attach(handler)?;
        debug!("handler attached");
        Ok(())
    }

    fn detach(&self) {
        self.shared.handler.detach();
    }

    fn has_handler(&self) -> bool {
        self.shared.handler.has_handler()
    }
}

impl Drop for FlowTransport {
    fn drop(&mut self) {
        if self.shared.handler.has_handler() {
            warn!("transport dropped with a handler still attached, detaching");
            self.shared.handler.detach();
        }

        let (link, pending, draining) = {
            let mut life = self.shared.lock_life();
            if life.state != ConnectionState::Disconnecting {
                life.state = ConnectionState::Disconnected;
            }
            (
                life.link.take(),
                life.pending_connect.take(),
                life.draining.take(),
            )
        };
        if let Some(draining) = draining {
            draining.abort();
        }
        if let Some(pending) = pending {
            let _ = pending.cancel.send(());
            pending.resolver.resolve(Err(WampError::Cancelled));
        }
        if let Some(link) = link {
            let _ = link.shutdown.send(true);
            link.reader.abort();
            link.writer.abort();
            link.dispatcher.abort();
        }
    }
}

impl Shared {
    fn lock_life(&self) -> MutexGuard<'_, Lifecycle> {
        self.life.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn establish(self: Arc<Self>, generation: u64, cancelled: oneshot::Receiver<()>) {
        let attempt = time::timeout(self.config.connect_timeout(), self.connector.connect());
        let outcome = tokio::select! {
            result = attempt => match result {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(WampError::Connection(reason))) => Err(WampError::Connection(reason)),
                Ok(Err(e)) => Err(WampError::Connection(e.to_string())),
                Err(_) => Err(WampError::Connection(format!(
                    "timed out after {}ms",
                    self.config.connect_timeout_ms
                ))),
            },
            _ = cancelled => {
                debug!(generation, "connect attempt abandoned");
                return;
            }
        };

        let (resolver, result) = {
            let mut life = self.lock_life();
            if life.generation != generation || life.state != ConnectionState::Connecting {
                return;
            }
            let Some(pending) = life.pending_connect.take() else {
                return;
            };
            match outcome {
                Ok(link) => {
                    let previous = life.draining.take();
                    life.link = Some(self.start_link(link, generation, previous));
                    life.state = ConnectionState::Connected;
                    info!(peer = %self.connector.describe(), generation, "transport connected");
                    (pending.resolver, Ok(()))
                }
                Err(e) => {
                    life.state = ConnectionState::Disconnected;
                    warn!(peer = %self.connector.describe(), error = %e, "connect failed");
                    (pending.resolver, Err(e))
                }
            }
        };
        resolver.resolve(result);
    }

    fn start_link(
        self: &Arc<Self>,
        link: Link,
        generation: u64,
        previous: Option<JoinHandle<()>>,
    ) -> LinkTasks {
        let Link { sink, source } = link;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.read_ahead);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.flow.reset(generation, &signals_tx);

        let reader = self.runtime.spawn(read_loop(self.clone(), source, inbound_tx));
        let writer = self.runtime.spawn(write_loop(
            self.clone(),
            generation,
            sink,
            outbound_rx,
            signals_tx.clone(),
            shutdown_rx.clone(),
        ));
        let dispatcher = self.runtime.spawn(dispatch_loop(
            self.clone(),
            generation,
            previous,
            inbound_rx,
            signals_rx,
            shutdown_rx,
        ));

        LinkTasks {
            outbound: outbound_tx,
            signals: signals_tx,
            shutdown: shutdown_tx,
            reader,
            writer,
            dispatcher,
        }
    }

    async fn teardown(self: Arc<Self>, generation: u64, link: Option<LinkTasks>) {
        if let Some(link) = link {
            let LinkTasks {
                outbound,
                signals,
                shutdown,
                reader,
                mut writer,
                mut dispatcher,
            } = link;
            let _ = shutdown.send(true);
            reader.abort();
            drop(outbound);
            drop(signals);

            let grace = self.config.shutdown_timeout();
            if time::timeout(grace, &mut writer).await.is_err() {
                warn!(
                    pending = self.flow.pending(),
                    "outbound flush timed out, closing forcibly"
                );
                writer.abort();
            }
            if time::timeout(grace, &mut dispatcher).await.is_err() {
                warn!("dispatcher did not stop in time");
                dispatcher.abort();
            }
        }

        let waiters = {
            let mut life = self.lock_life();
            if life.generation == generation && life.state == ConnectionState::Disconnecting {
                life.state = ConnectionState::Disconnected;
            }
            std::mem::take(&mut life.disconnect_waiters)
        };
        info!(generation, "transport disconnected");
        for waiter in waiters {
            waiter.resolve(Ok(()));
        }
    }

    /// Deliver buffered messages in arrival order until paused or empty.
    fn drain(&self, backlog: &mut Backlog) {
        while !self.is_paused() {
            let Some((epoch, message)) = backlog.pop_front() else {
                break;
            };
            self.handler
                .deliver(Some(epoch), |handler| handler.on_message(message));
        }
    }

    /// Wind down the dispatcher of link `generation`.
    ///
    /// With `lost` set the connection dropped underneath us. Messages still
    /// buffered, or a previous link's held messages not yet delivered, are
    /// handed to a follow-up task that delivers them once resumed and then
    /// reports the loss.
    fn retire(
        self: &Arc<Self>,
        generation: u64,
        mut lost: Option<WampError>,
        mut backlog: Backlog,
        previous: Option<JoinHandle<()>>,
    ) {
        if previous.is_none() {
            self.drain(&mut backlog);
        }

        let link = {
            let mut life = self.lock_life();
            let mut link = None;
            if lost.is_some() {
                if life.generation == generation && life.state == ConnectionState::Connected {
                    life.state = ConnectionState::Disconnected;
                    link = life.link.take();
                } else {
                    // A disconnect() is already tearing this link down.
                    lost = None;
                }
            }
            if let Some(reason) = &lost {
                warn!(generation, error = %reason, "transport connection lost");
            }
            if previous.is_some() || !backlog.is_empty() {
                debug!(
                    held = backlog.len(),
                    "holding undelivered messages until delivery resumes"
                );
                let task = self
                    .runtime
                    .spawn(self.clone().deliver_held(backlog, lost.take(), previous));
                life.draining = Some(task);
            }
            link
        };

        if let Some(link) = link {
            let _ = link.shutdown.send(true);
            link.reader.abort();
            link.writer.abort();
        }
        if let Some(reason) = lost {
            self.handler
                .deliver(None, |handler| handler.on_connection_lost(&reason));
        }
    }

    async fn deliver_held(
        self: Arc<Self>,
        mut backlog: Backlog,
        lost: Option<WampError>,
        previous: Option<JoinHandle<()>>,
    ) {
        let mut paused = self.paused.subscribe();
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            self.drain(&mut backlog);
            if backlog.is_empty() {
                break;
            }
            if paused.changed().await.is_err() {
                return;
            }
        }
        trace!("held messages delivered");
        if let Some(reason) = lost {
            self.handler
                .deliver(None, |handler| handler.on_connection_lost(&reason));
        }
    }
}

fn as_lost(error: WampError) -> WampError {
    match error {
        WampError::ConnectionLost(_) => error,
        other => WampError::ConnectionLost(other.to_string()),
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    inbound: mpsc::Sender<Inbound>,
) {
    let reason = loop {
        match source.recv().await {
            Ok(Some(message)) => {
                let epoch = shared.handler.epoch();
                if inbound.send(Inbound::Frame(epoch, message)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break WampError::ConnectionLost("peer closed the connection".into()),
            Err(e) => break as_lost(e),
        }
    };
    let _ = inbound.send(Inbound::Closed(reason)).await;
}

async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    signals: mpsc::UnboundedSender<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let result = sink.send(message).await;
                shared.flow.sent(generation, &signals);
                if let Err(e) = result {
                    let _ = signals.send(Signal::WriteFailed(e));
                    return;
                }
            }
            _ = shutdown.changed() => {
                // Flush what was queued before the disconnect.
                while let Ok(message) = outbound.try_recv() {
                    let result = sink.send(message).await;
                    shared.flow.sent(generation, &signals);
                    if let Err(e) = result {
                        debug!(error = %e, "write failed during flush");
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "closing backend sink failed");
    }
}

/// Wait for the previous link's held messages, if any are still pending.
async fn finished(previous: &mut Option<JoinHandle<()>>) {
    if let Some(task) = previous {
        let _ = task.await;
    }
}

/// Move frames already read ahead into the backlog.
fn collect(inbound: &mut mpsc::Receiver<Inbound>, backlog: &mut Backlog) {
    while let Ok(event) = inbound.try_recv() {
        if let Inbound::Frame(epoch, message) = event {
            backlog.push_back((epoch, message));
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut previous: Option<JoinHandle<()>>,
    mut inbound: mpsc::Receiver<Inbound>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let bound = shared.config.inbound_buffer;
    let mut paused = shared.paused.subscribe();
    let mut backlog = Backlog::new();

    loop {
        if previous.is_none() {
            shared.drain(&mut backlog);
        }
        // At the bound, stop reading so the backend's own flow control engages.
        let accepting = previous.is_none() && !(shared.is_paused() && backlog.len() >= bound);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(signal) = signals.recv() => match signal {
                Signal::Congested => shared.flow.fire_pause(),
                Signal::Drained => shared.flow.fire_resume(),
                Signal::WriteFailed(e) => {
                    collect(&mut inbound, &mut backlog);
                    shared.retire(generation, Some(as_lost(e)), backlog, previous);
                    return;
                }
            },
            _ = finished(&mut previous), if previous.is_some() => previous = None,
            event = inbound.recv(), if accepting => match event {
                Some(Inbound::Frame(epoch, message)) => backlog.push_back((epoch, message)),
                Some(Inbound::Closed(reason)) => {
                    shared.retire(generation, Some(reason), backlog, previous);
                    return;
                }
                None => {
                    let reason = WampError::ConnectionLost("reader stopped".into());
                    shared.retire(generation, Some(reason), backlog, previous);
                    return;
                }
            },
            _ = paused.changed() => {}
        }
    }

    collect(&mut inbound, &mut backlog);
    shared.retire(generation, None, backlog, previous);
}
