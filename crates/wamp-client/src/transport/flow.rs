//! Send-side congestion tracking.
//!
//! The writer's queue depth is counted as messages are queued and written.
//! Crossing the high watermark marks the transport congested; falling to the
//! low watermark clears it. Each transition is decided and announced under
//! one lock, so the dispatcher sees pause and resume signals strictly
//! alternating and in transition order.
//!
//! Counts belong to one connection generation. A writer of an earlier link
//! that is still winding down cannot move the current link's count.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};
use wamp_core::{FlowHandler, WampError};

/// Events routed from the send path and writer to the dispatcher.
#[derive(Debug)]
pub(crate) enum Signal {
    Congested,
    Drained,
    WriteFailed(WampError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Counts {
    generation: u64,
    pending: usize,
    congested: bool,
}

pub(crate) struct FlowControl {
    high: usize,
    low: usize,
    counts: Mutex<Counts>,
    on_pause: Mutex<Option<FlowHandler>>,
    on_resume: Mutex<Option<FlowHandler>>,
}

impl FlowControl {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low,
            counts: Mutex::new(Counts::default()),
            on_pause: Mutex::new(None),
            on_resume: Mutex::new(None),
        }
    }

    /// A message entered the outbound queue of link `generation`.
    pub(crate) fn queued(&self, generation: u64, signals: &UnboundedSender<Signal>) {
        let mut counts = lock(&self.counts);
        if counts.generation != generation {
            trace!(generation, "queued on a retired link");
            return;
        }
        counts.pending += 1;
        if !counts.congested && counts.pending >= self.high {
            counts.congested = true;
            debug!(pending = counts.pending, high = self.high, "outbound congested");
            let _ = signals.send(Signal::Congested);
        }
    }

    /// A message left the outbound queue of link `generation`, written or not.
    pub(crate) fn sent(&self, generation: u64, signals: &UnboundedSender<Signal>) {
        let mut counts = lock(&self.counts);
        if counts.generation != generation {
            trace!(generation, "write completed on a retired link");
            return;
        }
        counts.pending = counts.pending.saturating_sub(1);
        if counts.congested && counts.pending <= self.low {
            counts.congested = false;
            debug!(pending = counts.pending, low = self.low, "outbound drained");
            let _ = signals.send(Signal::Drained);
        }
    }

    /// Start counting afresh for link `generation`. If the previous link
    /// ended congested, the application is told it may send again.
    pub(crate) fn reset(&self, generation: u64, signals: &UnboundedSender<Signal>) {
        let mut counts = lock(&self.counts);
        counts.generation = generation;
        counts.pending = 0;
        if counts.congested {
            counts.congested = false;
            let _ = signals.send(Signal::Drained);
        }
    }

    pub(crate) fn is_congested(&self) -> bool {
        lock(&self.counts).congested
    }

    pub(crate) fn pending(&self) -> usize {
        lock(&self.counts).pending
    }

    pub(crate) fn set_pause_handler(&self, handler: FlowHandler) {
        *lock(&self.on_pause) = Some(handler);
    }

    pub(crate) fn set_resume_handler(&self, handler: FlowHandler) {
        *lock(&self.on_resume) = Some(handler);
    }

    // Handlers are cloned out so they may re-register without deadlocking.
    pub(crate) fn fire_pause(&self) {
        let handler = lock(&self.on_pause).clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn fire_resume(&self) {
        let handler = lock(&self.on_resume).clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn drain_signals(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(match signal {
                Signal::Congested => "congested",
                Signal::Drained => "drained",
                Signal::WriteFailed(_) => "failed",
            });
        }
        out
    }

    #[test]
    fn crossing_watermarks_signals_once_each() {
        let flow = FlowControl::new(4, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        flow.reset(1, &tx);

        for _ in 0..10 {
            flow.queued(1, &tx);
        }
        assert!(flow.is_congested());
        assert_eq!(drain_signals(&mut rx), vec!["congested"]);

        for _ in 0..8 {
            flow.sent(1, &tx);
        }
        assert!(flow.is_congested());
        assert!(drain_signals(&mut rx).is_empty());

        flow.sent(1, &tx);
        assert!(!flow.is_congested());
        assert_eq!(flow.pending(), 1);
        assert_eq!(drain_signals(&mut rx), vec!["drained"]);
    }

    #[test]
    fn reset_releases_congestion() {
        let flow = FlowControl::new(2, 0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        flow.reset(1, &tx);
        flow.queued(1, &tx);
        flow.queued(1, &tx);
        flow.reset(2, &tx);
        assert_eq!(flow.pending(), 0);
        assert!(!flow.is_congested());
        assert_eq!(drain_signals(&mut rx), vec!["congested", "drained"]);
    }

    #[test]
    fn retired_link_cannot_move_the_count() {
        let flow = FlowControl::new(4, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        flow.reset(1, &tx);
        flow.queued(1, &tx);
        flow.queued(1, &tx);

        // The next link starts while the old writer still finishes writes.
        flow.reset(2, &tx);
        flow.sent(1, &tx);
        flow.sent(1, &tx);
        flow.sent(1, &tx);
        assert_eq!(flow.pending(), 0);

        flow.queued(2, &tx);
        flow.queued(1, &tx);
        assert_eq!(flow.pending(), 1);
        flow.sent(2, &tx);
        flow.sent(2, &tx);
        assert_eq!(flow.pending(), 0);
        assert!(drain_signals(&mut rx).is_empty());
    }

    #[test]
    fn handlers_replace_previous() {
        let flow = FlowControl::new(2, 0);
        let hits = Arc::new(AtomicUsize::new(0));
        flow.set_pause_handler(Arc::new(|| panic!("replaced handler must not run")));
        let h = hits.clone();
        flow.set_pause_handler(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        flow.fire_pause();
        flow.fire_resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
