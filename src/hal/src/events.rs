//! A queued single-dispatcher implementation of [`EventDemux`].
//!
//! Hosts with their own interrupt plumbing implement [`EventDemux`]
//! directly; this implementation serves single-dispatcher embeddings and
//! test harnesses. Triggered tokens land in a bounded queue and their
//! handlers run when the owning loop calls [`EventLoop::run_pending`],
//! one at a time, mirroring run-to-completion interrupt dispatch.

use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::{EventDemux, EventHandler, IrqToken};

/// Maximum number of undispatched triggers.
const MAX_PENDING: usize = 256;

/// A per-CPU event dispatcher with deferred handler execution.
pub struct EventLoop {
    /// Installed handlers, indexed by token.
    handlers: Mutex<Vec<Option<EventHandler>>>,
    /// Tokens triggered but not yet dispatched.
    pending: ArrayQueue<u8>,
    /// CPU this dispatcher serves.
    cpu: u32,
}

impl EventLoop {
    /// Create a dispatcher for the given CPU.
    pub fn new(cpu: u32) -> Self {
        EventLoop {
            handlers: Mutex::new(Vec::new()),
            pending: ArrayQueue::new(MAX_PENDING),
            cpu,
        }
    }

    /// Run every pending handler; returns how many ran.
    ///
    /// Handlers execute outside the subscription lock, so they are free to
    /// subscribe further slots or trigger further events.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(token) = self.pending.pop() {
            let taken = {
                let mut handlers = self.handlers.lock();
                handlers.get_mut(token as usize).and_then(Option::take)
            };
            if let Some(mut handler) = taken {
                handler();
                ran += 1;
                let mut handlers = self.handlers.lock();
                let slot = &mut handlers[token as usize];
                if slot.is_none() {
                    *slot = Some(handler);
                }
            }
        }
        ran
    }
}

impl EventDemux for EventLoop {
    fn reserve(&self) -> IrqToken {
        let mut handlers = self.handlers.lock();
        let token = handlers.len() as u8;
        handlers.push(None);
        IrqToken(token)
    }

    fn install(&self, token: IrqToken, handler: EventHandler) {
        self.handlers.lock()[token.0 as usize] = Some(handler);
    }

    fn trigger(&self, token: IrqToken) {
        self.pending.push(token.0).expect("event queue full");
    }

    fn current_cpu(&self) -> u32 {
        self.cpu
    }
}
