use crate::arena::ClientArena;
use crate::logging;
use crate::net::conn::{self, ClientToken, ConnState, Connection};
use crate::net::support::{NetworkError, NetworkResult};
use crate::pool::{WorkItem, WorkerPool};
use crate::protocol::MAX_REQUEST;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::unix::UnixReady;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Registration token of the listening socket; client tokens start at 1.
pub const LISTENER: mio::Token = mio::Token(0);
/// Ready events consumed per poll wake.
pub const MAX_EVENTS: usize = 64;

// Poll with a timeout so the loop notices the shutdown flag without needing
// a wakeup descriptor.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The single-threaded event demultiplexer. Accepts clients, drains readable
/// sockets into per-connection buffers, frames requests for the worker pool
/// and pushes finished responses back out, all under edge-triggered interest.
pub struct Reactor {
    listener: TcpListener,
    poll: Arc<mio::Poll>,
    events: mio::Events,
    pending: Vec<(mio::Token, mio::Ready)>,

    arena: Arc<ClientArena>,
    pool: Arc<WorkerPool>,
    live: IndexSet<usize>,

    shutdown: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Reactor {
    pub fn new(
        listener: TcpListener,
        poll: Arc<mio::Poll>,
        arena: Arc<ClientArena>,
        pool: Arc<WorkerPool>,
        shutdown: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> NetworkResult<Reactor> {
        poll.register(
            &listener,
            LISTENER,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Reactor {
            listener,
            poll,
            events: mio::Events::with_capacity(MAX_EVENTS),
            pending: Vec::with_capacity(MAX_EVENTS),
            arena,
            pool,
            live: IndexSet::new(),
            shutdown,
            log,
        })
    }

    /// Drive the loop until the shutdown flag flips, then tear down every
    /// live connection.
    pub fn run(&mut self) -> NetworkResult<()> {
        logging::debug!(self.log, "reactor running");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(POLL_INTERVAL)) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            // Snapshot the batch; the handlers below need the reactor mutably.
            let mut pending = std::mem::replace(&mut self.pending, Vec::new());
            pending.clear();
            pending.extend(self.events.iter().map(|event| (event.token(), event.readiness())));

            for &(token, readiness) in &pending {
                if token == LISTENER {
                    self.accept_ready();
                    continue;
                }

                let index = conn::slot_index(token);

                // Events can trail a removal within the same batch.
                if !self.live.contains(&index) {
                    continue;
                }

                let readiness = UnixReady::from(readiness);

                if readiness.is_error() || readiness.is_hup() {
                    self.remove(index);
                    continue;
                }

                if readiness.is_readable() {
                    if let Err(err) = self.read_ready(index) {
                        self.close_on(index, err);
                        continue;
                    }
                }

                if readiness.is_writable() {
                    if let Err(err) = self.write_ready(index) {
                        self.close_on(index, err);
                    }
                }
            }

            self.pending = pending;
        }

        self.teardown();

        Ok(())
    }

    /// Drain the accept backlog. Edge-triggered interest on the listener
    /// means every pending connection must be taken before returning.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // The listener survives transient accept failures.
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let token = match self.arena.alloc() {
            Some(token) => token,
            None => {
                // Dropping the stream closes the socket.
                logging::warn!(self.log, "client slots exhausted, dropping connection";
                               "peer" => %peer);
                return;
            }
        };

        let slot = self.arena.slot(token.index).expect("freshly allocated slot");

        {
            let mut active = slot.connection();
            active.open(stream);

            if let Err(err) = active.register(token.mio_token(), &self.poll) {
                logging::warn!(self.log, "client registration failed";
                               "peer" => %peer,
                               "error" => %err);
                drop(active);
                self.arena.free(token);
                return;
            }
        }

        self.live.insert(token.index);

        logging::debug!(self.log, "client accepted"; "peer" => %peer, "slot" => token.index);
    }

    /// Readable edge: drain the socket, then frame and dispatch at most one
    /// request (further complete requests stay buffered until the current
    /// one's response has gone out).
    fn read_ready(&self, index: usize) -> NetworkResult<()> {
        let slot = match self.arena.slot(index) {
            Some(slot) => slot,
            None => return Err(NetworkError::StaleToken),
        };
        let mut active = slot.connection();

        if active.state() == ConnState::Closing {
            return Err(NetworkError::Closed);
        }

        let pool = &self.pool;
        let mut submit = |item| pool.submit(item);

        match active.receive() {
            Ok(()) => {
                frame_requests(&mut active, index, &mut submit);
                Ok(())
            }
            Err(NetworkError::Closed) => {
                // The peer half-closed after sending. Complete buffered
                // requests still get dispatched and answered; teardown waits
                // until the last response has drained (see write_ready).
                frame_requests(&mut active, index, &mut submit);

                if active.state() == ConnState::Reading {
                    return Err(NetworkError::Closed);
                }

                active.peer_closed = true;
                Ok(())
            }
            Err(NetworkError::Overrun) => {
                frame_requests(&mut active, index, &mut submit);

                // A full buffer is fatal only when it cannot produce a frame;
                // otherwise it is backpressure against a pipelining client.
                if active.state() != ConnState::Reading
                    || find_terminator(active.read_buffer.read_slice()).is_some()
                {
                    Ok(())
                } else {
                    Err(NetworkError::Overrun)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Writable edge: push the response out. Once the buffer empties the
    /// connection re-enters `Reading`, interest narrows back to read-only
    /// and any residual buffered request is dispatched.
    fn write_ready(&self, index: usize) -> NetworkResult<()> {
        let slot = match self.arena.slot(index) {
            Some(slot) => slot,
            None => return Err(NetworkError::StaleToken),
        };
        let mut active = slot.connection();

        match active.state() {
            ConnState::Writing => {}
            ConnState::Closing => return Err(NetworkError::Closed),
            // Spurious writable readiness, e.g. right after accept.
            _ => return Ok(()),
        }

        match active.send() {
            Ok(_sent) => {
                active.state = ConnState::Reading;

                let token = ClientToken {
                    index,
                    generation: active.generation(),
                };
                active.rearm_read(token.mio_token(), &self.poll)?;

                let pool = &self.pool;
                let mut submit = |item| pool.submit(item);
                frame_requests(&mut active, index, &mut submit);

                // A half-closed peer goes away once nothing is left to
                // answer.
                if active.peer_closed && active.state() == ConnState::Reading {
                    return Err(NetworkError::Closed);
                }

                Ok(())
            }
            Err(NetworkError::Wait) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn close_on(&mut self, index: usize, reason: NetworkError) {
        if reason.is_fatal() {
            logging::debug!(self.log, "closing client"; "slot" => index, "reason" => %reason);
            self.remove(index);
        }
    }

    /// Unregister from the poll, close the descriptor and hand the slot back
    /// to the arena.
    fn remove(&mut self, index: usize) {
        self.live.remove(&index);

        let token = match self.arena.slot(index) {
            Some(slot) => {
                let active = slot.connection();

                // Vacant slots hold no stream. Anything with one gets torn
                // down, including connections a worker already marked
                // Closing after a publish or interest-modification failure.
                match active.stream() {
                    Some(stream) => {
                        let _ = self.poll.deregister(stream);

                        Some(ClientToken {
                            index,
                            generation: active.generation(),
                        })
                    }
                    None => None,
                }
            }
            None => None,
        };

        if let Some(token) = token {
            self.arena.free(token);
            logging::debug!(self.log, "client removed"; "slot" => index);
        }
    }

    fn teardown(&mut self) {
        let live: Vec<usize> = self.live.iter().cloned().collect();

        for index in live {
            self.remove(index);
        }

        let _ = self.poll.deregister(&self.listener);

        logging::debug!(self.log, "reactor stopped");
    }
}

/// Locate the `\r\n` terminator in the buffered bytes.
fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}

/// Frame one request off the read buffer and hand it to `submit`. Dispatch
/// only happens in `Reading`: the connection moves to `Processing` and no
/// further request leaves the buffer until the response has been written
/// back, which keeps per-connection responses in request order.
fn frame_requests<F: FnMut(WorkItem)>(active: &mut Connection, index: usize, submit: &mut F) {
    if active.state() != ConnState::Reading {
        return;
    }

    let pos = match find_terminator(active.read_buffer.read_slice()) {
        Some(pos) => pos,
        None => return,
    };

    let len = pos.min(MAX_REQUEST);
    let request = active.read_buffer.read_slice()[..len].to_vec();

    active.read_buffer.move_head(pos + 2);
    active.state = ConnState::Processing;

    submit(WorkItem {
        token: ClientToken {
            index,
            generation: active.generation(),
        },
        request,
    });
}
