//! The single handler slot shared by the dispatcher and the application.
//!
//! Deliveries register the delivering thread while the callback runs;
//! `detach` clears the slot and then waits until no other thread is inside a
//! callback, so nothing reaches the old handler once `detach` returns. A
//! handler detaching itself from inside a callback does not wait on itself.
//!
//! Every attach and detach bumps an epoch. Messages are stamped with the
//! epoch current at arrival and dropped if it has moved on by delivery time.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};
use wamp_core::{TransportHandler, WampError, WampResult};

#[derive(Default)]
struct SlotInner {
    handler: Option<Weak<dyn TransportHandler>>,
    epoch: u64,
    delivering: Vec<ThreadId>,
}

impl SlotInner {
    fn live(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Default)]
pub(crate) struct HandlerSlot {
    inner: Mutex<SlotInner>,
    idle: Condvar,
}

/// Removes the delivering thread on exit, including on panic.
struct DeliveryGuard<'a> {
    slot: &'a HandlerSlot,
    thread: ThreadId,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.slot.lock();
        if let Some(pos) = inner.delivering.iter().position(|t| *t == self.thread) {
            inner.delivering.swap_remove(pos);
        }
        self.slot.idle.notify_all();
    }
}

impl HandlerSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, handler: &Arc<dyn TransportHandler>) -> WampResult<()> {
        {
            let mut inner = self.lock();
            if inner.live().is_some() {
                return Err(WampError::HandlerConflict);
            }
            if inner.handler.is_some() {
                debug!("replacing a handler that was dropped without detaching");
            }
            inner.handler = Some(Arc::downgrade(handler));
            inner.epoch += 1;
        }
        handler.on_attach();
        Ok(())
    }

    pub(crate) fn detach(&self) {
        let me = thread::current().id();
        let previous = {
            let mut inner = self.lock();
            let previous = inner.handler.take();
            inner.epoch += 1;
            while inner.delivering.iter().any(|t| *t != me) {
                inner = self
                    .idle
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            previous
        };
        if let Some(handler) = previous.as_ref().and_then(Weak::upgrade) {
            handler.on_detach();
        }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.lock().live().is_some()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Run `f` against the bound handler. With `epoch` set, only if no
    /// attach or detach happened since. Returns whether `f` ran.
    pub(crate) fn deliver(
        &self,
        epoch: Option<u64>,
        f: impl FnOnce(&dyn TransportHandler),
    ) -> bool {
        let thread = thread::current().id();
        let handler = {
            let mut inner = self.lock();
            if epoch.is_some_and(|e| e != inner.epoch) {
                trace!("dropping event from a previous handler binding");
                return false;
            }
            let Some(handler) = inner.live() else {
                trace!("no handler attached, dropping event");
                return false;
            };
            inner.delivering.push(thread);
            handler
        };
        let _guard = DeliveryGuard { slot: self, thread };
        f(handler.as_ref());
        true
    }
}
