use crate::bindings::KeyBindings;
use crate::logging;
use crate::mask::KeyMask;
use crate::net::buffer::Buffer;
use crate::net::packet::{self, Reply, Request};
use crate::net::support::{NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};

const READ_BUF_SIZE: usize = 4096;
const WRITE_BUF_SIZE: usize = 8192;

/// Staged key events per connection; overflow drops the oldest.
pub const KEY_BUFFER_CAPACITY: usize = 256;
/// Staged raw chunks per connection; overflow terminates the raw session.
pub const RAW_QUEUE_CAPACITY: usize = 16;

pub type ConnId = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    /// Accepted, nothing but AUTHKEY is admissible.
    New,
    Authenticated,
    /// Scheduled for teardown at the end of the current loop iteration.
    Closing,
}

/// How keys are delivered to the owning client. Fixed by the first
/// successful GETTTY, reset on LEAVETTY.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeyMode {
    None,
    Keycodes,
    Commands,
}

/// One client session: the socket, its framing buffers and everything the
/// server tracks about what the client controls.
pub struct Connection {
    id: Option<ConnId>,

    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    state: ConnState,

    read_buffer: Buffer,
    write_buffer: Buffer,

    key_buffer: VecDeque<u32>,
    raw_queue: VecDeque<Vec<u8>>,

    owned_tty: Option<u32>,
    key_mode: KeyMode,
    mask: KeyMask,
    bindings: Option<KeyBindings>,
    in_raw_mode: bool,

    log: logging::Logger,
}

impl Connection {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Connection {
        Connection {
            id: None,
            stream: None,
            peer: None,
            state: ConnState::New,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            key_buffer: VecDeque::with_capacity(KEY_BUFFER_CAPACITY),
            raw_queue: VecDeque::with_capacity(RAW_QUEUE_CAPACITY),
            owned_tty: None,
            key_mode: KeyMode::None,
            mask: KeyMask::new(),
            bindings: None,
            in_raw_mode: false,
            log: logging::child(log),
        }
    }

    /// Attaches a freshly accepted stream to this (vacant) slot.
    #[inline]
    pub fn open(&mut self, id: ConnId, stream: TcpStream, peer: SocketAddr) {
        if self.stream.is_some() {
            panic!("Attempted to open an already open connection");
        }

        self.id = Some(id);
        self.peer = Some(peer);
        self.state = ConnState::New;
        self.stream = Some(stream);

        logging::debug!(self.log, "connection opened";
                        "conn_id" => id,
                        "peer" => %peer);
    }

    /// Test hook: a session without a socket, driven entirely through its
    /// buffers.
    #[cfg(test)]
    pub fn open_detached(&mut self, id: ConnId, peer: SocketAddr) {
        self.id = Some(id);
        self.peer = Some(peer);
        self.state = ConnState::New;
    }

    /// Tears the session down and returns the slot to its pristine state.
    /// Registry and raw-gate release is the server's business and must
    /// happen before this is called.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing connection";
                        "conn_id" => self.id,
                        "pending_read" => self.read_buffer.len(),
                        "pending_write" => self.write_buffer.len(),
                        "staged_keys" => self.key_buffer.len());

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.key_buffer.clear();
        self.raw_queue.clear();

        self.id = None;
        self.peer = None;
        self.state = ConnState::New;
        self.owned_tty = None;
        self.key_mode = KeyMode::None;
        self.mask.clear();
        self.bindings = None;
        self.in_raw_mode = false;
    }

    /// Registers the socket on the supplied poll.
    #[inline]
    pub fn register(&self, token: mio::Token, poll: &mio::Poll) -> NetworkResult<()> {
        poll.register(
            self.stream.as_ref().expect("Can't register a detached connection"),
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters the socket from the supplied poll.
    #[inline]
    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        match self.stream.as_ref() {
            Some(stream) => poll.deregister(stream).map_err(Into::into),
            None => Ok(()),
        }
    }

    // --- state bookkeeping ---

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether a socket is attached (test sessions run detached).
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn set_authenticated(&mut self) {
        self.state = ConnState::Authenticated;
    }

    #[inline]
    pub fn begin_close(&mut self) {
        self.state = ConnState::Closing;
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn owned_tty(&self) -> Option<u32> {
        self.owned_tty
    }

    #[inline]
    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    #[inline]
    pub fn mask(&self) -> &KeyMask {
        &self.mask
    }

    #[inline]
    pub fn mask_mut(&mut self) -> &mut KeyMask {
        &mut self.mask
    }

    #[inline]
    pub fn in_raw_mode(&self) -> bool {
        self.in_raw_mode
    }

    #[inline]
    pub fn enter_raw(&mut self) {
        self.in_raw_mode = true;
    }

    #[inline]
    pub fn leave_raw(&mut self) {
        self.in_raw_mode = false;
        self.raw_queue.clear();
    }

    /// Records a granted tty along with the delivery mode and any bindings
    /// loaded for the grant.
    #[inline]
    pub fn grant_tty(&mut self, tty: u32, mode: KeyMode, bindings: Option<KeyBindings>) {
        self.owned_tty = Some(tty);
        self.key_mode = mode;
        self.bindings = bindings;
    }

    /// Drops tty ownership state: staged keys are discarded, the ignore mask
    /// and delivery mode reset.
    #[inline]
    pub fn release_tty(&mut self) -> Option<u32> {
        let tty = self.owned_tty.take();

        self.key_buffer.clear();
        self.key_mode = KeyMode::None;
        self.mask.clear();
        self.bindings = None;

        tty
    }

    /// Symbolic name for a keycode, if this client loaded bindings.
    #[inline]
    pub fn key_name(&self, key: u32) -> Option<&str> {
        self.bindings.as_ref().and_then(|bindings| bindings.name_of(key))
    }

    // --- socket I/O ---

    /// Reads all available data off the socket into the read buffer.
    /// `Ok(n)` means the buffer filled up with more possibly pending on the
    /// socket; `Err(Wait)` means the socket is drained.
    #[inline]
    pub fn receive(&mut self) -> NetworkResult<usize> {
        let stream = self.stream.as_ref().expect("Connection must have a stream");
        self.read_buffer.ingress(stream).map_err(Into::into)
    }

    /// Sends as much buffered egress as the socket accepts.
    #[inline]
    pub fn send(&mut self) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_ref().expect("Connection must have a stream");

        match self.write_buffer.egress(stream) {
            Ok(sent) => Ok(sent),
            // Partial writes surface as WouldBlock with the rest retained
            Err(err) => Err(err.into()),
        }
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    // --- framing ---

    /// Decodes one complete request off the read buffer. `Err(Wait)` until a
    /// whole frame is present.
    #[inline]
    pub fn read_request(&mut self) -> NetworkResult<Request> {
        let (code, payload) = packet::read_frame(&mut self.read_buffer)?;
        Request::decode(code, payload)
    }

    /// Queues a reply for transmission. `Err(Wait)` means the write buffer
    /// cannot take the frame right now.
    #[inline]
    pub fn queue_reply(&mut self, reply: &Reply) -> NetworkResult<()> {
        reply.write_into(&mut self.write_buffer)
    }

    // --- key staging ---

    /// Stages a key event for delivery. Returns true if the buffer was full
    /// and the oldest event was displaced.
    pub fn push_key(&mut self, key: u32) -> bool {
        let mut dropped = false;

        if self.key_buffer.len() == KEY_BUFFER_CAPACITY {
            let displaced = self.key_buffer.pop_front();
            dropped = true;

            logging::warn!(self.log, "key buffer overflow";
                           "conn_id" => self.id,
                           "displaced" => displaced);
        }

        self.key_buffer.push_back(key);
        dropped
    }

    /// Moves staged keys into the write buffer as KEY/COMMAND packets, in
    /// production order, until the write buffer pushes back.
    pub fn flush_keys(&mut self) -> NetworkResult<()> {
        while let Some(&key) = self.key_buffer.front() {
            let reply = match self.key_mode {
                KeyMode::Keycodes => Reply::Key(key),
                KeyMode::Commands => Reply::Command(key),
                KeyMode::None => {
                    // Lost the tty since the key was staged; nothing to deliver.
                    self.key_buffer.clear();
                    return Ok(());
                }
            };

            match reply.write_into(&mut self.write_buffer) {
                Ok(()) => {
                    self.key_buffer.pop_front();
                }
                Err(NetworkError::Wait) => return Ok(()),
                Err(fatal) => return Err(fatal),
            }
        }

        Ok(())
    }

    #[inline]
    pub fn staged_keys(&self) -> usize {
        self.key_buffer.len()
    }

    // --- raw staging ---

    /// Stages a raw chunk for the gate holder. Returns false on overflow,
    /// which terminates the raw session.
    pub fn push_raw(&mut self, chunk: Vec<u8>) -> bool {
        if self.raw_queue.len() == RAW_QUEUE_CAPACITY {
            logging::warn!(self.log, "raw queue overflow"; "conn_id" => self.id);
            return false;
        }

        self.raw_queue.push_back(chunk);
        true
    }

    /// Moves staged raw chunks into the write buffer as PACKET frames.
    pub fn flush_raw(&mut self) -> NetworkResult<()> {
        while let Some(chunk) = self.raw_queue.front() {
            match Reply::RawPacket(chunk.as_slice()).write_into(&mut self.write_buffer) {
                Ok(()) => {
                    self.raw_queue.pop_front();
                }
                Err(NetworkError::Wait) => return Ok(()),
                Err(fatal) => return Err(fatal),
            }
        }

        Ok(())
    }

    #[inline]
    pub fn staged_raw(&self) -> usize {
        self.raw_queue.len()
    }

    // --- test plumbing ---

    /// Injects raw wire bytes as if they had arrived on the socket.
    #[cfg(test)]
    pub fn inject(&mut self, bytes: &[u8]) {
        drop(self.read_buffer.ingress(bytes));
    }

    #[cfg(test)]
    pub fn write_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }
}
