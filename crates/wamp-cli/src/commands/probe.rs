//! `wamp probe <url>`: open a transport to a router and exchange raw messages.
//!
//! Each `--send` payload is queued in order once connected. Everything the
//! router sends back within `--wait-ms` is printed, one message per line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use wamp_client::{connector_for, FlowTransport, Serializer, TransportConfig};
use wamp_core::{Message, Transport, TransportHandler, WampError};

/// Prints every received message to stdout.
struct Printer {
    lost: AtomicBool,
}

impl TransportHandler for Printer {
    fn on_message(&self, message: Message) {
        println!("{}", String::from_utf8_lossy(message.as_bytes()));
    }

    fn on_connection_lost(&self, reason: &WampError) {
        self.lost.store(true, Ordering::SeqCst);
        warn!(%reason, "connection lost");
        eprintln!("wamp: connection lost: {reason}");
    }
}

pub async fn run(
    url: &str,
    serializer: &str,
    messages: &[String],
    wait_ms: u64,
    config: TransportConfig,
) -> Result<()> {
    let serializer: Serializer = serializer.parse()?;
    let connector = connector_for(url, serializer)?;
    let target = connector.describe();
    let transport = FlowTransport::new(connector, config)?;

    transport.set_pause_handler(Arc::new(|| debug!("router is slow, outbound congested")));
    transport.set_resume_handler(Arc::new(|| debug!("outbound drained")));

    let printer = Arc::new(Printer {
        lost: AtomicBool::new(false),
    });
    let handler: Arc<dyn TransportHandler> = printer.clone();
    transport.attach(&handler)?;

    transport
        .connect()
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    info!(%target, "connected");

    for text in messages {
        transport
            .send_message(Message::from(text.as_str()))
            .with_context(|| format!("failed to send to {target}"))?;
    }

    tokio::time::sleep(Duration::from_millis(wait_ms)).await;

    transport.disconnect().await.context("disconnect failed")?;
    transport.detach();

    if printer.lost.load(Ordering::SeqCst) {
        anyhow::bail!("{target} closed the connection");
    }
    Ok(())
}
