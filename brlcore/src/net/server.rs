use crate::api::rawgate::RawGate;
use crate::api::registry::TtyRegistry;
use crate::api::router::{self, Route};
use crate::auth::Authenticator;
use crate::bindings::KeyBindings;
use crate::driver::{Console, Driver, ScreenReader};
use crate::error::ApiError;
use crate::logging;
use crate::net::connection::{ConnId, ConnState, Connection, KeyMode};
use crate::net::packet::{Reply, Request, HOW_COMMANDS, HOW_KEYCODES, MAX_PAYLOAD_SIZE, RAW_MAGIC};
use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use byteorder::{BigEndian, WriteBytesExt};
use indexmap::IndexSet;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str;
use std::time::Duration;

/// Default listening port of the API server.
pub const DEFAULT_PORT: u16 = 35751;

/// The server loop: owns the listening socket, the slab of connections and
/// every piece of shared arbitration state. All mutation happens on the one
/// thread driving `run`, so the ownership invariants need no locks.
pub struct Server {
    listener: TcpListener,

    poll: mio::Poll,
    events: mio::Events,

    connections: Vec<Connection>,
    free: Vec<ConnId>,
    live: IndexSet<ConnId>,

    registry: TtyRegistry,
    rawgate: RawGate,

    driver: Box<dyn Driver>,
    console: Box<dyn Console>,
    reader: Box<dyn ScreenReader>,
    auth: Authenticator,
    key_dir: Option<PathBuf>,

    log: logging::Logger,
}

impl Server {
    const LISTENER_TOKEN: mio::Token = mio::Token(0);
    /// The driver's keystroke source is a poll-style capability, not a file
    /// descriptor, so the socket wait doubles as the key-probe cadence.
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        driver: Box<dyn Driver>,
        console: Box<dyn Console>,
        reader: Box<dyn ScreenReader>,
        auth: Authenticator,
        key_dir: Option<PathBuf>,
        log: L,
    ) -> NetworkResult<Server> {
        let poll = mio::Poll::new()?;
        let listener = TcpListener::bind(&address.parse::<SocketAddr>()?)?;

        poll.register(
            &listener,
            Self::LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Server {
            listener,
            poll,
            events: mio::Events::with_capacity(1024),
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            registry: TtyRegistry::new(),
            rawgate: RawGate::new(),
            driver,
            console,
            reader,
            auth,
            key_dir,
            log: logging::child(log.into()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server loop until the poll itself fails.
    pub fn run(&mut self) -> NetworkResult<()> {
        logging::info!(self.log, "server loop running";
                       "address" => ?self.listener.local_addr().ok());

        loop {
            self.tick()?;
        }
    }

    /// One loop iteration: wait, accept, read + dispatch, pump keys and raw
    /// data, flush, reap. Every invariant of the arbitration state holds
    /// again by the time this returns.
    pub fn tick(&mut self) -> NetworkResult<()> {
        self.poll.poll(&mut self.events, Some(Self::POLL_INTERVAL))?;

        let ready: Vec<(mio::Token, mio::Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, readiness) in ready {
            if token == Self::LISTENER_TOKEN {
                self.accept_pending();
                continue;
            }

            let id = usize::from(token) - 1;

            // The event may be stale: the connection can have failed earlier
            // in this same iteration.
            if !self.live.contains(&id) || self.connections[id].is_closing() {
                continue;
            }

            if readiness.is_readable() {
                self.service_read(id);
            }

            if readiness.is_writable() && !self.connections[id].is_closing() {
                self.service_write(id);
            }
        }

        self.pump_driver_keys();
        self.pump_raw();
        self.flush_all();
        self.reap();

        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = match self.free.pop() {
                        Some(id) => id,
                        None => {
                            let id = self.connections.len();
                            self.connections.push(Connection::new(&self.log));
                            id
                        }
                    };

                    self.connections[id].open(id, stream, peer);

                    if self.connections[id]
                        .register(Self::token_of(id), &self.poll)
                        .has_failed()
                    {
                        logging::warn!(self.log, "stream registration failed"; "conn_id" => id);
                        self.connections[id].close();
                        self.free.push(id);
                        continue;
                    }

                    self.live.insert(id);
                    logging::info!(self.log, "client connected"; "conn_id" => id, "peer" => %peer);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Drains the socket and dispatches every complete frame. Alternates
    /// between reading and dispatching so a pipelining client cannot wedge
    /// the read buffer.
    fn service_read(&mut self, id: ConnId) {
        loop {
            match self.connections[id].receive() {
                // Buffer reached capacity; drain frames to make room.
                Ok(_) => {
                    self.drain_requests(id);
                    if self.connections[id].is_closing() {
                        return;
                    }
                }
                // Socket drained: process what arrived.
                Err(NetworkError::Wait) => {
                    self.drain_requests(id);
                    return;
                }
                Err(NetworkError::Fatal(err)) => {
                    logging::debug!(self.log, "connection lost";
                                    "conn_id" => id,
                                    "error" => ?err);
                    self.connections[id].begin_close();
                    return;
                }
            }
        }
    }

    fn service_write(&mut self, id: ConnId) {
        if self.connections[id].send().has_failed() {
            self.connections[id].begin_close();
        }
    }

    /// Decodes and dispatches frames until the buffer runs short. Framing
    /// violations answer `ERROR(INVALID_PACKET)` and take the session down.
    fn drain_requests(&mut self, id: ConnId) {
        loop {
            if self.connections[id].is_closing() {
                return;
            }

            match self.connections[id].read_request() {
                Ok(request) => self.dispatch(id, request),
                Err(NetworkError::Wait) => return,
                Err(NetworkError::Fatal(err)) => {
                    logging::debug!(self.log, "bad frame";
                                    "conn_id" => id,
                                    "error" => ?err);

                    match err {
                        ErrorType::PayloadTooLarge | ErrorType::BadFrame => {
                            self.queue_to(id, &Reply::Error(ApiError::InvalidPacket.code()));
                        }
                        _ => {}
                    }

                    self.connections[id].begin_close();
                    return;
                }
            }
        }
    }

    /// Runs one request through its handler and queues the outcome.
    fn dispatch(&mut self, id: ConnId, request: Request) {
        match self.handle(id, request) {
            Ok(Some(payload)) => self.queue_to(id, &Reply::Ack(&payload)),
            Ok(None) => {}
            Err(err) => {
                logging::debug!(self.log, "request refused";
                                "conn_id" => id,
                                "error" => %err,
                                "code" => err.code());

                self.queue_to(id, &Reply::Error(err.code()));

                if err.closes_connection() {
                    self.connections[id].begin_close();
                }
            }
        }
    }

    /// The request table. `Ok(Some(payload))` becomes an ACK, `Ok(None)`
    /// stays silent, `Err` becomes an ERROR reply.
    fn handle(&mut self, id: ConnId, request: Request) -> Result<Option<Vec<u8>>, ApiError> {
        let connections = &mut self.connections;
        let registry = &mut self.registry;
        let rawgate = &mut self.rawgate;
        let driver = &mut self.driver;
        let console = &self.console;
        let auth = &self.auth;
        let key_dir = &self.key_dir;
        let log = &self.log;

        let conn = &mut connections[id];

        match conn.state() {
            // Whatever trickles in after teardown started is dropped.
            ConnState::Closing => return Ok(None),
            // Nothing but a matching AUTHKEY is admissible before
            // authentication.
            ConnState::New => {
                return match request {
                    Request::AuthKey(supplied) if auth.verify(&supplied) => {
                        conn.set_authenticated();
                        logging::info!(log, "client authenticated"; "conn_id" => id);
                        Ok(Some(Vec::new()))
                    }
                    _ => {
                        conn.begin_close();
                        Err(ApiError::ConnectionRefused)
                    }
                };
            }
            ConnState::Authenticated => {}
        }

        match request {
            Request::AuthKey(_) => Err(ApiError::IllegalInstruction),

            Request::Bye => {
                conn.begin_close();
                Ok(Some(Vec::new()))
            }

            Request::GetDriverId => Ok(Some(driver.driver_id().to_vec())),

            Request::GetDriverName => Ok(Some(driver.driver_name().as_bytes().to_vec())),

            Request::GetDisplaySize => {
                let (x, y) = driver.display_size();
                let mut payload = [0u8; 8];
                {
                    let mut stream = &mut payload[..];
                    stream
                        .write_u32::<BigEndian>(x)
                        .expect("Error writing display width");
                    stream
                        .write_u32::<BigEndian>(y)
                        .expect("Error writing display height");
                }
                Ok(Some(payload.to_vec()))
            }

            Request::GetTty { tty, how, binding } => {
                if conn.owned_tty().is_some() {
                    return Err(ApiError::IllegalInstruction);
                }

                let mode = match how {
                    HOW_KEYCODES => KeyMode::Keycodes,
                    HOW_COMMANDS => KeyMode::Commands,
                    _ => return Err(ApiError::InvalidParameter),
                };

                // Commands are produced by translating driver keys, so a
                // keyless driver satisfies neither delivery mode.
                if !driver.keys_supported() {
                    return Err(ApiError::KeysNotSupported);
                }

                // tty 0 names the peer's controlling terminal; resolve it to
                // a concrete number before touching the registry.
                let tty = match tty {
                    0 => {
                        let peer = conn.peer().ok_or(ApiError::InvalidParameter)?;
                        console
                            .controlling_tty(peer)
                            .ok_or(ApiError::InvalidParameter)?
                    }
                    tty => tty,
                };

                let bindings = match binding.is_empty() {
                    true => None,
                    false => {
                        let client =
                            str::from_utf8(&binding).map_err(|_| ApiError::InvalidParameter)?;
                        let dir = key_dir
                            .clone()
                            .or_else(KeyBindings::default_dir)
                            .ok_or(ApiError::InvalidParameter)?;
                        let path = KeyBindings::resolve(&dir, client, driver.driver_id())
                            .map_err(|_| ApiError::InvalidParameter)?;

                        let bindings = KeyBindings::load(&path).map_err(|err| {
                            logging::info!(log, "binding file rejected";
                                           "conn_id" => id,
                                           "path" => %path.display(),
                                           "error" => ?err);
                            ApiError::InvalidParameter
                        })?;

                        Some(bindings)
                    }
                };

                if !registry.acquire(tty, id) {
                    return Err(ApiError::TtyBusy);
                }

                conn.grant_tty(tty, mode, bindings);
                logging::info!(log, "tty granted";
                               "conn_id" => id,
                               "tty" => tty,
                               "mode" => ?mode);

                Ok(Some(Vec::new()))
            }

            Request::LeaveTty => {
                if conn.owned_tty().is_none() {
                    return Err(ApiError::IllegalInstruction);
                }

                // A raw session cannot outlive the tty grant backing it.
                if rawgate.release(id) {
                    driver.end_raw();
                    conn.leave_raw();
                }

                if let Some(tty) = conn.release_tty() {
                    registry.release(tty);
                    logging::info!(log, "tty released"; "conn_id" => id, "tty" => tty);
                }

                Ok(Some(Vec::new()))
            }

            Request::Write { cursor, text } => {
                if conn.owned_tty().is_none() || rawgate.is_held() {
                    return Err(ApiError::IllegalInstruction);
                }

                let text = str::from_utf8(&text).map_err(|_| ApiError::InvalidParameter)?;

                let (x, y) = driver.display_size();
                let cells = (x as usize) * (y as usize);

                let mut line = String::with_capacity(cells);
                let mut count = 0;
                for ch in text.chars() {
                    if count == cells {
                        break;
                    }
                    line.push(ch);
                    count += 1;
                }
                for _ in count..cells {
                    line.push(' ');
                }

                let cursor = match cursor >= 1 && cursor as usize <= cells {
                    true => Some(cursor),
                    false => None,
                };

                driver
                    .write_cells(&line, cursor)
                    .map_err(|_| ApiError::OpNotSupported)?;

                Ok(Some(Vec::new()))
            }

            Request::WriteDots(dots) => {
                if conn.owned_tty().is_none() || rawgate.is_held() {
                    return Err(ApiError::IllegalInstruction);
                }

                let (x, y) = driver.display_size();
                if dots.len() != (x as usize) * (y as usize) {
                    return Err(ApiError::InvalidPacket);
                }

                driver.write_dots(&dots).map_err(|_| ApiError::OpNotSupported)?;

                Ok(Some(Vec::new()))
            }

            Request::StatWrite(cells) => {
                if conn.owned_tty().is_none() || rawgate.is_held() {
                    return Err(ApiError::IllegalInstruction);
                }

                driver
                    .write_status(&cells)
                    .map_err(|_| ApiError::OpNotSupported)?;

                Ok(Some(Vec::new()))
            }

            Request::MaskKeys { lo, hi } => {
                if conn.owned_tty().is_none() {
                    return Err(ApiError::IllegalInstruction);
                }
                if lo > hi {
                    return Err(ApiError::InvalidParameter);
                }

                conn.mask_mut().add(lo, hi);
                Ok(Some(Vec::new()))
            }

            Request::UnmaskKeys { lo, hi } => {
                if conn.owned_tty().is_none() {
                    return Err(ApiError::IllegalInstruction);
                }
                if lo > hi {
                    return Err(ApiError::InvalidParameter);
                }

                conn.mask_mut().remove(lo, hi);
                Ok(Some(Vec::new()))
            }

            Request::GetRaw { magic } => {
                if magic != RAW_MAGIC {
                    return Err(ApiError::InvalidParameter);
                }
                if conn.owned_tty().is_none() {
                    return Err(ApiError::IllegalInstruction);
                }
                if !driver.raw_supported() {
                    return Err(ApiError::RawNotSupported);
                }
                if !rawgate.acquire(id) {
                    return Err(ApiError::IllegalInstruction);
                }

                if driver.begin_raw().is_err() {
                    rawgate.release(id);
                    return Err(ApiError::OpNotSupported);
                }

                conn.enter_raw();
                logging::info!(log, "raw mode entered"; "conn_id" => id);

                Ok(Some(Vec::new()))
            }

            Request::LeaveRaw => {
                if !rawgate.is_held_by(id) {
                    return Err(ApiError::IllegalInstruction);
                }

                rawgate.release(id);
                driver.end_raw();
                conn.leave_raw();
                logging::info!(log, "raw mode left"; "conn_id" => id);

                Ok(Some(Vec::new()))
            }

            Request::RawPacket(bytes) => {
                if !rawgate.is_held_by(id) {
                    return Err(ApiError::IllegalInstruction);
                }

                // Raw forwarding has no reply channel; failures only log.
                if driver.raw_send(&bytes).is_err() {
                    logging::warn!(log, "raw send failed"; "conn_id" => id, "size" => bytes.len());
                }

                Ok(None)
            }

            Request::Unknown(code) => {
                logging::debug!(log, "unknown packet type"; "conn_id" => id, "code" => code);
                Err(ApiError::UnknownInstruction)
            }
        }
    }

    /// Queues a reply; a connection whose write buffer cannot even take the
    /// reply is beyond saving and gets torn down.
    fn queue_to(&mut self, id: ConnId, reply: &Reply) {
        if self.connections[id].queue_reply(reply).is_err() {
            logging::warn!(self.log, "write buffer exhausted, aborting connection";
                           "conn_id" => id);
            self.connections[id].begin_close();
        }
    }

    /// Feeds pending driver keys through the router. Suspended entirely
    /// while the raw gate is held: raw mode short-circuits the driver and
    /// keystrokes travel the raw channel instead.
    fn pump_driver_keys(&mut self) {
        if self.rawgate.is_held() {
            return;
        }

        while let Some(key) = self.driver.read_key() {
            self.route_key(key);
        }
    }

    fn route_key(&mut self, key: u32) {
        let foreground = self.console.foreground_tty();

        match router::route(&self.registry, foreground, &self.connections, key) {
            Route::ScreenReader => self.reader.deliver_key(key),
            Route::Owner(owner) => {
                let delivery = match self.connections[owner].key_mode() {
                    KeyMode::Commands => match self.driver.translate_key(key) {
                        Some(command) => Some(command),
                        None => {
                            logging::debug!(self.log, "keycode without command mapping dropped";
                                            "conn_id" => owner,
                                            "key" => key);
                            None
                        }
                    },
                    _ => Some(key),
                };

                if let Some(code) = delivery {
                    self.connections[owner].push_key(code);
                }
            }
        }
    }

    /// Forwards raw chunks from the driver to the gate holder. Overflowing
    /// the holder's raw queue terminates the raw session with NOMEM.
    fn pump_raw(&mut self) {
        let holder = match self.rawgate.holder() {
            Some(holder) => holder,
            None => return,
        };

        while let Some(chunk) = self.driver.raw_recv() {
            if chunk.len() > MAX_PAYLOAD_SIZE {
                logging::warn!(self.log, "oversize raw chunk dropped"; "size" => chunk.len());
                continue;
            }

            if !self.connections[holder].push_raw(chunk) {
                self.queue_to(holder, &Reply::Error(ApiError::NoMem.code()));
                self.end_raw_session(holder);
                break;
            }
        }
    }

    fn end_raw_session(&mut self, id: ConnId) {
        if self.rawgate.release(id) {
            self.driver.end_raw();
            self.connections[id].leave_raw();
            logging::info!(self.log, "raw session terminated"; "conn_id" => id);
        }
    }

    /// Moves staged keys and raw chunks into write buffers and pushes
    /// pending egress out on every live connection.
    fn flush_all(&mut self) {
        let ids: Vec<ConnId> = self.live.iter().copied().collect();

        for id in ids {
            let conn = &mut self.connections[id];

            if conn.is_closing() {
                continue;
            }

            if conn.flush_keys().has_failed() || conn.flush_raw().has_failed() {
                conn.begin_close();
                continue;
            }

            if conn.has_egress() && conn.is_attached() && conn.send().has_failed() {
                conn.begin_close();
            }
        }
    }

    /// Tears down every connection scheduled for closure, releasing its tty
    /// and the raw gate before the iteration ends.
    fn reap(&mut self) {
        let closing: Vec<ConnId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| self.connections[id].is_closing())
            .collect();

        for id in closing {
            self.teardown(id);
        }
    }

    fn teardown(&mut self, id: ConnId) {
        if let Some(tty) = self.connections[id].owned_tty() {
            self.registry.release(tty);
        }

        self.end_raw_session(id);

        let conn = &mut self.connections[id];
        if conn.is_attached() {
            // Best-effort delivery of the final reply before shutdown.
            drop(conn.send());
            drop(conn.deregister(&self.poll));
        }
        conn.close();

        self.live.remove(&id);
        self.free.push(id);

        logging::info!(self.log, "client disconnected"; "conn_id" => id);
    }

    #[inline]
    fn token_of(id: ConnId) -> mio::Token {
        mio::Token(id + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, DriverResult};
    use crate::net::packet::{opcode, read_frame, write_frame};
    use hashbrown::HashMap;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    const SECRET: [u8; 3] = [0x01, 0x02, 0x03];

    #[derive(Default)]
    struct DriverState {
        written: Vec<(String, Option<u32>)>,
        dots: Vec<Vec<u8>>,
        status: Vec<Vec<u8>>,
        keys: VecDeque<u32>,
        commands: HashMap<u32, u32>,
        raw_input: VecDeque<Vec<u8>>,
        raw_sent: Vec<Vec<u8>>,
        raw_active: bool,
    }

    struct MockDriver {
        state: Rc<RefCell<DriverState>>,
        keys_supported: bool,
        raw_supported: bool,
    }

    impl Driver for MockDriver {
        fn driver_id(&self) -> [u8; 2] {
            *b"mk"
        }

        fn driver_name(&self) -> &str {
            "mock display"
        }

        fn display_size(&self) -> (u32, u32) {
            (80, 1)
        }

        fn write_cells(&mut self, text: &str, cursor: Option<u32>) -> DriverResult<()> {
            self.state
                .borrow_mut()
                .written
                .push((text.to_string(), cursor));
            Ok(())
        }

        fn write_dots(&mut self, dots: &[u8]) -> DriverResult<()> {
            self.state.borrow_mut().dots.push(dots.to_vec());
            Ok(())
        }

        fn write_status(&mut self, cells: &[u8]) -> DriverResult<()> {
            self.state.borrow_mut().status.push(cells.to_vec());
            Ok(())
        }

        fn keys_supported(&self) -> bool {
            self.keys_supported
        }

        fn read_key(&mut self) -> Option<u32> {
            self.state.borrow_mut().keys.pop_front()
        }

        fn translate_key(&self, key: u32) -> Option<u32> {
            self.state.borrow().commands.get(&key).copied()
        }

        fn raw_supported(&self) -> bool {
            self.raw_supported
        }

        fn begin_raw(&mut self) -> DriverResult<()> {
            match self.raw_supported {
                true => {
                    self.state.borrow_mut().raw_active = true;
                    Ok(())
                }
                false => Err(DriverError::Unsupported),
            }
        }

        fn end_raw(&mut self) {
            self.state.borrow_mut().raw_active = false;
        }

        fn raw_send(&mut self, packet: &[u8]) -> DriverResult<()> {
            self.state.borrow_mut().raw_sent.push(packet.to_vec());
            Ok(())
        }

        fn raw_recv(&mut self) -> Option<Vec<u8>> {
            self.state.borrow_mut().raw_input.pop_front()
        }
    }

    struct FixedConsole {
        foreground: Rc<Cell<Option<u32>>>,
        controlling: Option<u32>,
    }

    impl Console for FixedConsole {
        fn foreground_tty(&self) -> Option<u32> {
            self.foreground.get()
        }

        fn controlling_tty(&self, _peer: SocketAddr) -> Option<u32> {
            self.controlling
        }
    }

    struct RecordingReader {
        keys: Rc<RefCell<Vec<u32>>>,
    }

    impl ScreenReader for RecordingReader {
        fn deliver_key(&mut self, key: u32) {
            self.keys.borrow_mut().push(key);
        }
    }

    struct Rig {
        server: Server,
        driver: Rc<RefCell<DriverState>>,
        foreground: Rc<Cell<Option<u32>>>,
        reader_keys: Rc<RefCell<Vec<u32>>>,
    }

    impl Rig {
        fn new() -> Rig {
            Rig::build(true, true, None, None)
        }

        fn build(
            keys_supported: bool,
            raw_supported: bool,
            controlling: Option<u32>,
            key_dir: Option<PathBuf>,
        ) -> Rig {
            let driver_state = Rc::new(RefCell::new(DriverState::default()));
            let foreground = Rc::new(Cell::new(None));
            let reader_keys = Rc::new(RefCell::new(Vec::new()));

            let server = Server::new(
                "127.0.0.1:0",
                Box::new(MockDriver {
                    state: driver_state.clone(),
                    keys_supported,
                    raw_supported,
                }),
                Box::new(FixedConsole {
                    foreground: foreground.clone(),
                    controlling,
                }),
                Box::new(RecordingReader {
                    keys: reader_keys.clone(),
                }),
                Authenticator::new(SECRET.to_vec(), None),
                key_dir,
                None,
            )
            .unwrap();

            Rig {
                server,
                driver: driver_state,
                foreground,
                reader_keys,
            }
        }

        /// Adds a detached (socketless) session driven through its buffers.
        fn connect(&mut self) -> ConnId {
            let id = self.server.connections.len();
            self.server.connections.push(Connection::new(None));
            self.server.connections[id].open_detached(id, "127.0.0.1:9000".parse().unwrap());
            self.server.live.insert(id);
            id
        }

        fn authenticate(&mut self, id: ConnId) {
            self.server.dispatch(id, Request::AuthKey(SECRET.to_vec()));
            assert_eq!(self.take_reply(id), (opcode::ACK, Vec::new()));
        }

        fn session(&mut self) -> ConnId {
            let id = self.connect();
            self.authenticate(id);
            id
        }

        fn take_reply(&mut self, id: ConnId) -> (u32, Vec<u8>) {
            read_frame(self.server.connections[id].write_buffer_mut())
                .expect("expected a queued reply")
        }

        fn assert_ack(&mut self, id: ConnId) {
            assert_eq!(self.take_reply(id), (opcode::ACK, Vec::new()));
        }

        fn assert_error(&mut self, id: ConnId, err: ApiError) {
            let (code, payload) = self.take_reply(id);
            assert_eq!(code, opcode::ERROR);
            assert_eq!(payload, err.code().to_be_bytes().to_vec());
        }

        fn no_reply(&mut self, id: ConnId) {
            assert_eq!(
                read_frame(self.server.connections[id].write_buffer_mut()).unwrap_err(),
                NetworkError::Wait
            );
        }

        fn get_tty(&mut self, id: ConnId, tty: u32, how: u32) {
            self.server.dispatch(
                id,
                Request::GetTty {
                    tty,
                    how,
                    binding: Vec::new(),
                },
            );
        }

        fn press_keys(&mut self, keys: &[u32]) {
            self.driver.borrow_mut().keys.extend(keys.iter().copied());
            self.server.pump_driver_keys();
        }
    }

    // --- end to end scenarios ---

    #[test]
    fn test_handshake_then_write() {
        let mut rig = Rig::new();
        let id = rig.connect();

        rig.server.dispatch(id, Request::AuthKey(vec![0x01, 0x02, 0x03]));
        rig.assert_ack(id);

        rig.get_tty(id, 7, HOW_COMMANDS);
        rig.assert_ack(id);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: b"hello".to_vec(),
            },
        );
        rig.assert_ack(id);

        let state = rig.driver.borrow();
        assert_eq!(state.written.len(), 1);

        let (text, cursor) = &state.written[0];
        assert_eq!(text.len(), 80);
        assert!(text.starts_with("hello"));
        assert!(text[5..].chars().all(|ch| ch == ' '));
        assert_eq!(*cursor, None);
    }

    #[test]
    fn test_auth_failure_then_clean_retry() {
        let mut rig = Rig::new();

        let first = rig.connect();
        rig.server.dispatch(first, Request::AuthKey(vec![0xBB]));
        rig.assert_error(first, ApiError::ConnectionRefused);
        assert!(rig.server.connections[first].is_closing());

        rig.server.reap();
        assert!(!rig.server.live.contains(&first));

        let second = rig.connect();
        rig.server.dispatch(second, Request::AuthKey(SECRET.to_vec()));
        rig.assert_ack(second);
    }

    #[test]
    fn test_tty_contention() {
        let mut rig = Rig::new();
        let a = rig.session();
        let b = rig.session();

        rig.get_tty(a, 3, HOW_KEYCODES);
        rig.assert_ack(a);

        rig.get_tty(b, 3, HOW_KEYCODES);
        rig.assert_error(b, ApiError::TtyBusy);

        rig.server.dispatch(a, Request::LeaveTty);
        rig.assert_ack(a);

        rig.get_tty(b, 3, HOW_KEYCODES);
        rig.assert_ack(b);
        assert_eq!(rig.server.registry.lookup(3), Some(b));
    }

    #[test]
    fn test_raw_lockout() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);
        assert!(rig.driver.borrow().raw_active);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: b"locked".to_vec(),
            },
        );
        rig.assert_error(id, ApiError::IllegalInstruction);

        rig.server.dispatch(id, Request::LeaveRaw);
        rig.assert_ack(id);
        assert!(!rig.driver.borrow().raw_active);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: b"open".to_vec(),
            },
        );
        rig.assert_ack(id);

        // No cell write happened while the gate was held.
        assert_eq!(rig.driver.borrow().written.len(), 1);
    }

    #[test]
    fn test_key_routing_with_mask() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.foreground.set(Some(5));
        rig.get_tty(id, 5, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::MaskKeys { lo: 0x10, hi: 0x1F });
        rig.assert_ack(id);

        rig.press_keys(&[0x05, 0x15, 0x20]);

        rig.server.flush_all();

        let (code, payload) = rig.take_reply(id);
        assert_eq!(code, opcode::KEY);
        assert_eq!(payload, vec![0, 0, 0, 0x05]);

        let (code, payload) = rig.take_reply(id);
        assert_eq!(code, opcode::KEY);
        assert_eq!(payload, vec![0, 0, 0, 0x20]);

        rig.no_reply(id);
        assert_eq!(*rig.reader_keys.borrow(), vec![0x15]);
    }

    #[test]
    fn test_malformed_frame_closes() {
        let mut rig = Rig::new();
        let id = rig.session();

        let mut frame = Vec::new();
        frame.extend_from_slice(&600u32.to_be_bytes());
        frame.extend_from_slice(&(b'W' as u32).to_be_bytes());
        rig.server.connections[id].inject(&frame);

        rig.server.drain_requests(id);

        rig.assert_error(id, ApiError::InvalidPacket);
        assert!(rig.server.connections[id].is_closing());

        rig.server.reap();
        assert!(!rig.server.live.contains(&id));
    }

    // --- auth gate ---

    #[test]
    fn test_requests_before_auth_are_refused() {
        let mut rig = Rig::new();
        let id = rig.connect();

        rig.server.dispatch(id, Request::GetDriverId);

        rig.assert_error(id, ApiError::ConnectionRefused);
        assert!(rig.server.connections[id].is_closing());
    }

    #[test]
    fn test_second_authkey_is_illegal() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::AuthKey(SECRET.to_vec()));
        rig.assert_error(id, ApiError::IllegalInstruction);
        assert!(!rig.server.connections[id].is_closing());
    }

    // --- info requests ---

    #[test]
    fn test_info_requests() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::GetDriverId);
        assert_eq!(rig.take_reply(id), (opcode::ACK, b"mk".to_vec()));

        rig.server.dispatch(id, Request::GetDriverName);
        assert_eq!(rig.take_reply(id), (opcode::ACK, b"mock display".to_vec()));

        rig.server.dispatch(id, Request::GetDisplaySize);
        let (code, payload) = rig.take_reply(id);
        assert_eq!(code, opcode::ACK);
        assert_eq!(payload, vec![0, 0, 0, 80, 0, 0, 0, 1]);
    }

    #[test]
    fn test_unknown_instruction_keeps_connection() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::Unknown(b'Z' as u32));

        rig.assert_error(id, ApiError::UnknownInstruction);
        assert!(!rig.server.connections[id].is_closing());
    }

    // --- tty management ---

    #[test]
    fn test_gettty_validates_how() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.get_tty(id, 3, 5);
        rig.assert_error(id, ApiError::InvalidParameter);
    }

    #[test]
    fn test_gettty_requires_key_support() {
        let mut rig = Rig::build(false, false, None, None);
        let id = rig.session();

        rig.get_tty(id, 3, HOW_KEYCODES);
        rig.assert_error(id, ApiError::KeysNotSupported);
    }

    #[test]
    fn test_gettty_twice_is_illegal() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.get_tty(id, 3, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.get_tty(id, 4, HOW_KEYCODES);
        rig.assert_error(id, ApiError::IllegalInstruction);
    }

    #[test]
    fn test_tty_zero_resolves_against_peer() {
        let mut rig = Rig::build(true, true, Some(9), None);
        let id = rig.session();

        rig.get_tty(id, 0, HOW_KEYCODES);
        rig.assert_ack(id);

        assert_eq!(rig.server.registry.lookup(9), Some(id));
        assert_eq!(rig.server.connections[id].owned_tty(), Some(9));
    }

    #[test]
    fn test_tty_zero_unresolvable() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.get_tty(id, 0, HOW_KEYCODES);
        rig.assert_error(id, ApiError::InvalidParameter);
        assert!(rig.server.registry.is_empty());
    }

    #[test]
    fn test_leavetty_without_tty_is_illegal() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::LeaveTty);
        rig.assert_error(id, ApiError::IllegalInstruction);
    }

    // --- bindings ---

    #[test]
    fn test_gettty_loads_binding_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("editor-mk.kbd"), "0x10 panleft\n0x11 panright\n")
            .unwrap();

        let mut rig = Rig::build(true, true, None, Some(dir.path().to_path_buf()));
        let id = rig.session();

        rig.server.dispatch(
            id,
            Request::GetTty {
                tty: 3,
                how: HOW_KEYCODES,
                binding: b"editor".to_vec(),
            },
        );
        rig.assert_ack(id);

        assert_eq!(rig.server.connections[id].key_name(0x11), Some("panright"));
        assert_eq!(rig.server.connections[id].key_name(0x12), None);
    }

    #[test]
    fn test_gettty_binding_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("editor-mk.kbd"), "not a binding\n").unwrap();

        let mut rig = Rig::build(true, true, None, Some(dir.path().to_path_buf()));
        let id = rig.session();

        rig.server.dispatch(
            id,
            Request::GetTty {
                tty: 3,
                how: HOW_KEYCODES,
                binding: b"editor".to_vec(),
            },
        );

        rig.assert_error(id, ApiError::InvalidParameter);
        // The grant failed as a whole; the tty stays free.
        assert!(rig.server.registry.is_empty());
    }

    #[test]
    fn test_gettty_binding_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut rig = Rig::build(true, true, None, Some(dir.path().to_path_buf()));
        let id = rig.session();

        rig.server.dispatch(
            id,
            Request::GetTty {
                tty: 3,
                how: HOW_KEYCODES,
                binding: b"editor".to_vec(),
            },
        );

        rig.assert_error(id, ApiError::InvalidParameter);
    }

    // --- writes ---

    #[test]
    fn test_write_requires_tty() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: b"x".to_vec(),
            },
        );
        rig.assert_error(id, ApiError::IllegalInstruction);
    }

    #[test]
    fn test_write_cursor_shown_within_width() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 80,
                text: b"edge".to_vec(),
            },
        );
        rig.assert_ack(id);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 81,
                text: b"past".to_vec(),
            },
        );
        rig.assert_ack(id);

        let state = rig.driver.borrow();
        assert_eq!(state.written[0].1, Some(80));
        assert_eq!(state.written[1].1, None);
    }

    #[test]
    fn test_write_truncates_to_display() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        let long = vec![b'a'; 200];
        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: long,
            },
        );
        rig.assert_ack(id);

        let state = rig.driver.borrow();
        assert_eq!(state.written[0].0.len(), 80);
    }

    #[test]
    fn test_write_rejects_invalid_utf8() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(
            id,
            Request::Write {
                cursor: 0,
                text: vec![0xFF, 0xFE],
            },
        );
        rig.assert_error(id, ApiError::InvalidParameter);
        assert!(!rig.server.connections[id].is_closing());
    }

    #[test]
    fn test_writedots_size_checked() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::WriteDots(vec![0u8; 80]));
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::WriteDots(vec![0u8; 79]));
        rig.assert_error(id, ApiError::InvalidPacket);
        assert!(rig.server.connections[id].is_closing());
    }

    #[test]
    fn test_statwrite_passes_through() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::StatWrite(vec![1, 2, 3]));
        rig.assert_ack(id);

        assert_eq!(rig.driver.borrow().status, vec![vec![1, 2, 3]]);
    }

    // --- raw mode ---

    #[test]
    fn test_getraw_validations() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::GetRaw { magic: 0x1234 });
        rig.assert_error(id, ApiError::InvalidParameter);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_error(id, ApiError::IllegalInstruction); // no tty yet
    }

    #[test]
    fn test_getraw_requires_driver_support() {
        let mut rig = Rig::build(true, false, None, None);
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_error(id, ApiError::RawNotSupported);
    }

    #[test]
    fn test_raw_gate_excludes_other_holders() {
        let mut rig = Rig::new();
        let a = rig.session();
        let b = rig.session();

        rig.get_tty(a, 1, HOW_KEYCODES);
        rig.assert_ack(a);
        rig.get_tty(b, 2, HOW_KEYCODES);
        rig.assert_ack(b);

        rig.server.dispatch(a, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(a);

        rig.server.dispatch(b, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_error(b, ApiError::IllegalInstruction);

        // The other connection is locked out of writes too.
        rig.server.dispatch(
            b,
            Request::Write {
                cursor: 0,
                text: b"blocked".to_vec(),
            },
        );
        rig.assert_error(b, ApiError::IllegalInstruction);
    }

    #[test]
    fn test_raw_packets_forwarded_both_ways() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::RawPacket(vec![0x10, 0x20]));
        rig.no_reply(id);
        assert_eq!(rig.driver.borrow().raw_sent, vec![vec![0x10, 0x20]]);

        rig.driver.borrow_mut().raw_input.push_back(vec![0xAA]);
        rig.server.pump_raw();
        rig.server.flush_all();

        let (code, payload) = rig.take_reply(id);
        assert_eq!(code, opcode::PACKET);
        assert_eq!(payload, vec![0xAA]);
    }

    #[test]
    fn test_raw_packet_without_gate_is_illegal() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::RawPacket(vec![0x10]));
        rig.assert_error(id, ApiError::IllegalInstruction);
    }

    #[test]
    fn test_keys_suspended_while_raw_held() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.foreground.set(Some(1));
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        rig.press_keys(&[0x42]);

        assert_eq!(rig.server.connections[id].staged_keys(), 0);
        assert!(rig.reader_keys.borrow().is_empty());
    }

    #[test]
    fn test_raw_queue_overflow_terminates_session() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        {
            let mut state = rig.driver.borrow_mut();
            for _ in 0..20 {
                state.raw_input.push_back(vec![0x55]);
            }
        }

        rig.server.pump_raw();

        rig.assert_error(id, ApiError::NoMem);
        assert!(!rig.server.rawgate.is_held());
        assert!(!rig.driver.borrow().raw_active);
        // The connection itself survives.
        assert!(!rig.server.connections[id].is_closing());
    }

    #[test]
    fn test_leavetty_releases_raw_gate() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 1, HOW_KEYCODES);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::LeaveTty);
        rig.assert_ack(id);

        assert!(!rig.server.rawgate.is_held());
        assert!(!rig.driver.borrow().raw_active);
        assert!(rig.server.registry.is_empty());
    }

    // --- command translation ---

    #[test]
    fn test_command_mode_translates_keys() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.foreground.set(Some(2));
        rig.get_tty(id, 2, HOW_COMMANDS);
        rig.assert_ack(id);

        rig.driver.borrow_mut().commands.insert(0x05, 0x9000);

        rig.press_keys(&[0x05, 0x06]); // 0x06 has no mapping and is dropped
        rig.server.flush_all();

        let (code, payload) = rig.take_reply(id);
        assert_eq!(code, opcode::COMMAND);
        assert_eq!(payload, vec![0, 0, 0x90, 0x00]);

        rig.no_reply(id);
    }

    // --- disconnect cleanup ---

    #[test]
    fn test_bye_acks_then_cleans_up() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 3, HOW_KEYCODES);
        rig.assert_ack(id);
        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::Bye);
        rig.assert_ack(id);
        assert!(rig.server.connections[id].is_closing());

        rig.server.reap();

        assert!(!rig.server.live.contains(&id));
        assert!(rig.server.registry.is_empty());
        assert!(!rig.server.rawgate.is_held());
        assert!(!rig.driver.borrow().raw_active);
    }

    #[test]
    fn test_disconnect_releases_everything_in_one_iteration() {
        let mut rig = Rig::new();
        let id = rig.session();
        rig.get_tty(id, 3, HOW_KEYCODES);
        rig.assert_ack(id);
        rig.server.dispatch(id, Request::GetRaw { magic: RAW_MAGIC });
        rig.assert_ack(id);

        // Socket death is reported as a fatal receive error; emulate the
        // aftermath directly.
        rig.server.connections[id].begin_close();
        rig.server.reap();

        assert_eq!(rig.server.registry.lookup(3), None);
        assert!(!rig.server.rawgate.is_held());
        assert!(rig.server.free.contains(&id));

        // The slot is clean and reusable.
        let next = rig.server.free.pop().unwrap();
        assert_eq!(rig.server.connections[next].state(), ConnState::New);
        assert_eq!(rig.server.connections[next].owned_tty(), None);
    }

    #[test]
    fn test_requests_after_bye_are_dropped() {
        let mut rig = Rig::new();
        let id = rig.session();

        rig.server.dispatch(id, Request::Bye);
        rig.assert_ack(id);

        rig.server.dispatch(id, Request::GetDriverId);
        rig.no_reply(id);
    }

    // --- framing through real buffers ---

    #[test]
    fn test_pipelined_requests_processed_in_order() {
        let mut rig = Rig::new();
        let id = rig.session();

        let mut wire = crate::net::buffer::Buffer::new(4096);
        let mut gettty = Vec::new();
        gettty.extend_from_slice(&3u32.to_be_bytes());
        gettty.extend_from_slice(&HOW_KEYCODES.to_be_bytes());
        write_frame(&mut wire, opcode::GETTTY, &gettty).unwrap();
        write_frame(&mut wire, opcode::MASKKEYS, &[0, 0, 0, 1, 0, 0, 0, 9]).unwrap();
        write_frame(&mut wire, opcode::LEAVETTY, &[]).unwrap();

        rig.server.connections[id].inject(wire.read_slice());
        rig.server.drain_requests(id);

        rig.assert_ack(id); // GETTTY
        rig.assert_ack(id); // MASKKEYS
        rig.assert_ack(id); // LEAVETTY
        assert!(rig.server.registry.is_empty());
    }
}
