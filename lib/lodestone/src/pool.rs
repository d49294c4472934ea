use crate::arena::ClientArena;
use crate::logging;
use crate::net::conn::{ClientToken, ConnState};
use crate::protocol::{self, Command, ParseError, Reply};
use crate::queue::WorkQueue;
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Default number of worker threads.
pub const NUM_WORKERS: usize = 4;

/// A framed request bound to the connection it arrived on. Produced by the
/// reactor, consumed by exactly one worker.
pub struct WorkItem {
    pub token: ClientToken,
    pub request: Vec<u8>,
}

struct WorkerCtx {
    store: Arc<Store>,
    arena: Arc<ClientArena>,
    queue: Arc<WorkQueue<WorkItem>>,
    poll: Arc<mio::Poll>,
    shutdown: Arc<AtomicBool>,
    log: logging::Logger,
}

/// Fixed-size pool of worker threads draining the work queue. Each worker
/// executes commands against the store, publishes the response into the
/// originating connection and asks the poll to watch for writability.
pub struct WorkerPool {
    queue: Arc<WorkQueue<WorkItem>>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    log: logging::Logger,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        store: Arc<Store>,
        arena: Arc<ClientArena>,
        queue: Arc<WorkQueue<WorkItem>>,
        poll: Arc<mio::Poll>,
        shutdown: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> WorkerPool {
        let handles = (0..workers)
            .map(|id| {
                let ctx = WorkerCtx {
                    store: store.clone(),
                    arena: arena.clone(),
                    queue: queue.clone(),
                    poll: poll.clone(),
                    shutdown: shutdown.clone(),
                    log: log.new(logging::o!("worker" => id)),
                };

                thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || Self::worker_loop(ctx))
                    .expect("Error spawning worker thread")
            })
            .collect();

        logging::debug!(log, "worker pool started"; "workers" => workers);

        WorkerPool {
            queue,
            shutdown,
            workers: Mutex::new(handles),
            log,
        }
    }

    /// Hand a framed request to the pool. Never blocks.
    #[inline]
    pub fn submit(&self, item: WorkItem) {
        self.queue.push(item);
    }

    /// Stop the pool: raise the flag, wake every parked worker and join them
    /// all. Workers finish their current item but never start a new one.
    /// Queued items that no worker picked up are dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.notify_all();

        let mut workers = self.workers.lock().expect("worker handle list poisoned");

        for handle in workers.drain(..) {
            if handle.join().is_err() {
                logging::error!(self.log, "worker thread panicked");
            }
        }

        logging::debug!(self.log, "worker pool stopped");
    }

    fn worker_loop(ctx: WorkerCtx) {
        logging::debug!(ctx.log, "worker started");

        loop {
            if ctx.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let item = match ctx.queue.pop() {
                Some(item) => item,
                // Empty: park until a push or the shutdown broadcast. A None
                // from park is a spurious or shutdown wakeup; the loop head
                // re-checks the flag either way.
                None => match ctx.queue.park(&ctx.shutdown) {
                    Some(item) => item,
                    None => continue,
                },
            };

            Self::process(&ctx, item);
        }

        logging::debug!(ctx.log, "worker stopped");
    }

    /// Execute one request and publish the response. Stale tokens (the
    /// connection died or was recycled while the item sat in the queue) are
    /// dropped without touching the slot.
    fn process(ctx: &WorkerCtx, item: WorkItem) {
        let reply = Self::execute(&ctx.store, &item.request);
        let response = reply.to_bytes();

        let slot = match ctx.arena.slot(item.token.index) {
            Some(slot) => slot,
            None => return,
        };

        let mut conn = slot.connection();

        if conn.generation() != item.token.generation {
            logging::trace!(ctx.log, "dropping stale work item"; "slot" => item.token.index);
            return;
        }

        // Only a connection parked in Processing may have its write side
        // touched; anything else indicates the reactor tore it down.
        if conn.state() != ConnState::Processing {
            return;
        }

        if conn.install_response(&response).is_err() {
            logging::warn!(ctx.log, "response exceeds write buffer"; "slot" => item.token.index);
            conn.state = ConnState::Closing;
            return;
        }

        conn.state = ConnState::Writing;

        // Publish first, then widen interest: the writable edge must find the
        // response already in place.
        if let Err(err) = conn.arm_write(item.token.mio_token(), &ctx.poll) {
            logging::warn!(ctx.log, "interest modification failed";
                           "slot" => item.token.index,
                           "error" => %err);
            conn.state = ConnState::Closing;
        }
    }

    fn execute(store: &Store, request: &[u8]) -> Reply {
        match protocol::parse(request) {
            Ok(Command::Get(key)) => match store.get(key) {
                Some(value) => Reply::Value(value),
                None => Reply::NotFound,
            },
            Ok(Command::Set(key, value)) => {
                store.set(key, value);
                Reply::Ok
            }
            Err(ParseError::UnknownCommand) => Reply::UnknownCommand,
            Err(ParseError::InvalidFormat) => Reply::InvalidFormat,
        }
    }
}
