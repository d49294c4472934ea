use crate::net::buffer::Buffer;
use crate::net::support::{NetworkError, NetworkResult};
use mio;
use mio::net::TcpStream;
use std::io;

pub const READ_BUF_SIZE: usize = 4096;
pub const WRITE_BUF_SIZE: usize = 4096;

/// Where a connection sits in its request cycle. `Closing` doubles as the
/// vacant state of a pooled slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    /// The reactor owns the read path; no request is in flight.
    Reading,
    /// A framed request has been handed to a worker.
    Processing,
    /// A response sits in the write buffer waiting to be drained.
    Writing,
    /// Torn down (or never opened); the slot is reclaimable.
    Closing,
}

/// Stable handle to a pooled connection: the slot index plus the generation
/// the slot had when the handle was minted. A recycled slot bumps its
/// generation, so handles outliving their connection become inert instead of
/// touching a stranger's socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientToken {
    pub index: usize,
    pub generation: u64,
}

impl ClientToken {
    /// Poll registration token. `Token(0)` is reserved for the listener.
    #[inline]
    pub fn mio_token(&self) -> mio::Token {
        mio::Token(self.index + 1)
    }
}

/// Slot index encoded in a poll event token.
#[inline]
pub fn slot_index(token: mio::Token) -> usize {
    token.0 - 1
}

/// Represents one client socket together with its buffers and state tag.
/// Lives inside an arena slot behind a mutex; the reactor owns the read path
/// and interest changes back to read-only, a worker owns the response path.
pub struct Connection {
    stream: Option<TcpStream>,
    pub(crate) state: ConnState,
    pub(crate) generation: u64,
    /// The peer half-closed its write side. Requests framed before the EOF
    /// still get answered; the connection is torn down once the last
    /// response has drained.
    pub(crate) peer_closed: bool,
    pub(crate) read_buffer: Buffer,
    pub(crate) write_buffer: Buffer,
}

impl Connection {
    pub fn new() -> Connection {
        Connection {
            stream: None,
            state: ConnState::Closing,
            generation: 0,
            peer_closed: false,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
        }
    }

    /// Bind a freshly accepted stream to this slot. The slot must be vacant.
    pub fn open(&mut self, stream: TcpStream) {
        if self.state != ConnState::Closing {
            panic!("Attempted to open an already open connection");
        }

        self.stream = Some(stream);
        self.state = ConnState::Reading;
        self.peer_closed = false;
        self.read_buffer.clear();
        self.write_buffer.clear();
    }

    /// Tear the connection down: drop the stream (closing the descriptor),
    /// clear the buffers and advance the generation so outstanding handles
    /// go stale.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Closing;
        self.generation += 1;
        self.peer_closed = false;
        self.read_buffer.clear();
        self.write_buffer.clear();
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Registers this connection on the supplied poll with edge-triggered
    /// read interest.
    pub fn register(&self, token: mio::Token, poll: &mio::Poll) -> NetworkResult<()> {
        poll.register(
            self.live_stream(),
            token,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Widen registered interest to read + write. Issued by a worker right
    /// after it publishes a response.
    pub fn arm_write(&self, token: mio::Token, poll: &mio::Poll) -> NetworkResult<()> {
        poll.reregister(
            self.live_stream(),
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Narrow registered interest back to read-only. Issued by the reactor
    /// once the write buffer has fully drained.
    pub fn rearm_read(&self, token: mio::Token, poll: &mio::Poll) -> NetworkResult<()> {
        poll.reregister(
            self.live_stream(),
            token,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        poll.deregister(self.live_stream()).map_err(Into::into)
    }

    /// Drain the socket into the read buffer. `Ok` means the socket went dry
    /// (would-block); `Closed` is end of stream, `Overrun` a full buffer with
    /// the socket still readable.
    pub fn receive(&mut self) -> NetworkResult<()> {
        let stream = self.stream.as_ref().expect("Connection must have a live stream");

        match self.read_buffer.ingress(stream) {
            Ok(_received) => Err(NetworkError::Closed),
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => Ok(()),
                _ if self.read_buffer.free_capacity() == 0 => Err(NetworkError::Overrun),
                _ => Err(NetworkError::Io(err)),
            },
        }
    }

    /// Push buffered response bytes to the socket. `Ok(sent)` means the
    /// write buffer fully drained; `Wait` leaves the remainder for the next
    /// writable edge.
    pub fn send(&mut self) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_ref().expect("Connection must have a live stream");

        self.write_buffer.egress(stream).map_err(Into::into)
    }

    /// Copy a formatted response into the write buffer, replacing whatever
    /// was there. Only legal while a worker holds the connection in
    /// `Processing`.
    pub fn install_response(&mut self, response: &[u8]) -> NetworkResult<()> {
        if response.len() > self.write_buffer.capacity() {
            return Err(NetworkError::Overrun);
        }

        self.write_buffer.clear();
        self.write_buffer.write_slice()[..response.len()].copy_from_slice(response);
        self.write_buffer.move_tail(response.len());

        Ok(())
    }

    #[inline]
    fn live_stream(&self) -> &TcpStream {
        self.stream.as_ref().expect("Connection must have a live stream")
    }
}
