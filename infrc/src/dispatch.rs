//! The dispatcher: a single-threaded, cooperative poll loop.
//!
//! One dispatcher thread owns all transport state. Pollers (the transport's
//! completion/bootstrap poller, the worker manager's completed-RPC drain)
//! register here and are invoked round-robin by [`Dispatch::poll`]. Because
//! every transport mutation happens on this thread, the transport's internal
//! structures need no locking.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Result;

/// Something the dispatcher polls each iteration.
pub trait Poller {
    /// Run one polling step. Returns true if any useful work was done.
    fn poll(&self) -> Result<bool>;

    /// Name used when reporting poller errors.
    fn name(&self) -> &'static str;
}

/// The dispatcher. Create it on the thread that will run the loop.
pub struct Dispatch {
    pollers: RefCell<Vec<Rc<dyn Poller>>>,
    owner: ThreadId,
    /// How long `run` keeps spinning with no work before yielding the core.
    idle_poll: Duration,
    stop: AtomicBool,
}

impl Dispatch {
    pub fn new(poll_micros: u64) -> Rc<Self> {
        Rc::new(Self {
            pollers: RefCell::new(Vec::new()),
            owner: thread::current().id(),
            idle_poll: Duration::from_micros(poll_micros),
            stop: AtomicBool::new(false),
        })
    }

    /// Register a poller. Dispatcher thread only.
    pub fn register(&self, poller: Rc<dyn Poller>) {
        debug_assert!(self.is_dispatch_thread());
        self.pollers.borrow_mut().push(poller);
    }

    /// True when called from the thread that created this dispatcher.
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Run each registered poller once. Returns true if any poller found
    /// work. Poller errors are reported and do not stop the loop.
    pub fn poll(&self) -> bool {
        debug_assert!(self.is_dispatch_thread());
        // Clone the list so a poller that re-enters `poll` (the handshake
        // pump) does not hold the registry borrow.
        let pollers: Vec<_> = self.pollers.borrow().clone();
        let mut found_work = false;
        for poller in pollers {
            match poller.poll() {
                Ok(did_work) => found_work |= did_work,
                Err(e) => warn!(poller = poller.name(), error = %e, "poller failed"),
            }
        }
        found_work
    }

    /// Ask a running [`Dispatch::run`] loop to return.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Poll until [`Dispatch::shutdown`] is called. Spins while work keeps
    /// arriving; after `poll_micros` without any work it yields the core
    /// between iterations.
    pub fn run(&self) {
        debug_assert!(self.is_dispatch_thread());
        let mut last_work = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            if self.poll() {
                last_work = Instant::now();
            } else if last_work.elapsed() > self.idle_poll {
                thread::yield_now();
            }
        }
    }
}
