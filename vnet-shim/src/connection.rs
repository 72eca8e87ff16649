//! Connections: socket-like endpoints tracked by a virtual interface.
//!
//! A connection bridges one application-facing local socket to either an
//! engine socket (stream/datagram) or directly to the virtual wire (raw).
//! Connections are owned by the interface's [`ConnectionTable`]; everything
//! else refers to them by [`ConnectionId`] and must revalidate the id
//! against the table before use.
//!
//! [`ConnectionTable`]: crate::table::ConnectionTable

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::bridge::LocalSocket;
use crate::engine::EngineSocket;

/// Stable identity of a connection: an arena slot plus the generation the
/// slot had when the connection was inserted. A released slot bumps its
/// generation, so stale ids never resolve to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// Socket type requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Byte stream (TCP) through the stack engine.
    Stream,
    /// Datagrams (UDP) through the stack engine.
    Datagram,
    /// Ethernet frames straight to the virtual wire, bypassing the engine.
    Raw,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Stream => "stream",
            SocketType::Datagram => "datagram",
            SocketType::Raw => "raw",
        }
    }

    pub fn uses_engine(&self) -> bool {
        !matches!(self, SocketType::Raw)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SocketType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(SocketType::Stream),
            "datagram" => Ok(SocketType::Datagram),
            "raw" => Ok(SocketType::Raw),
            _ => Err(()),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unbound => "UNBOUND",
            ConnectionState::Bound => "BOUND",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }

    /// Closing or closed: no further I/O is accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded FIFO of bytes staged between the engine and the local socket.
#[derive(Debug)]
pub struct StagingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl StagingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
        }
    }

    /// Append as much of `bytes` as fits. Returns the number appended.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend(&bytes[..n]);
        n
    }

    /// Append all of `bytes`, even past capacity. The caller applies
    /// back-pressure once [`is_full`](Self::is_full) holds.
    pub fn push_all(&mut self, bytes: &[u8]) -> usize {
        self.data.extend(bytes);
        bytes.len()
    }

    /// Put bytes back at the front, ahead of anything staged since.
    pub fn unshift(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.data.push_front(b);
        }
    }

    /// Remove and return everything staged.
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    /// Remove and return the first `n` bytes (fewer if less is staged).
    pub fn take_front(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// Drop everything staged.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Drop the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Contiguous view of the staged bytes.
    pub fn as_slice(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }
}

/// One socket-like endpoint.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    socket_type: SocketType,
    engine_socket: Option<EngineSocket>,
    local: Option<LocalSocket>,
    state: ConnectionState,
    closure_time: Option<Instant>,
    /// Inbound bytes pulled from the engine, waiting for the local socket.
    pub(crate) rx: StagingBuffer,
    /// Outbound bytes from the local socket, waiting for the engine.
    pub(crate) tx: StagingBuffer,
    /// A reader is currently pushing `rx` to the local socket.
    pub(crate) rx_in_flight: bool,
    /// Lengths of the datagrams staged in `rx`, oldest first.
    pub(crate) rx_datagrams: VecDeque<usize>,
    /// The peer closed while inbound bytes were still staged; the local
    /// socket is closed once `rx` drains.
    pub(crate) close_local_pending: bool,
    /// Reads on the local socket are paused until `tx` drains.
    pub(crate) local_read_paused: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        socket_type: SocketType,
        engine_socket: Option<EngineSocket>,
        local: Option<LocalSocket>,
        rx_capacity: usize,
        tx_capacity: usize,
    ) -> Self {
        Self {
            id,
            socket_type,
            engine_socket,
            local,
            state: ConnectionState::Unbound,
            closure_time: None,
            rx: StagingBuffer::new(rx_capacity),
            tx: StagingBuffer::new(tx_capacity),
            rx_in_flight: false,
            rx_datagrams: VecDeque::new(),
            close_local_pending: false,
            local_read_paused: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn engine_socket(&self) -> Option<EngineSocket> {
        self.engine_socket
    }

    pub fn local(&self) -> Option<LocalSocket> {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn closure_time(&self) -> Option<Instant> {
        self.closure_time
    }

    pub(crate) fn set_local(&mut self, local: LocalSocket) {
        self.local = Some(local);
    }

    /// Move to a live state. Ignored once the connection is terminal.
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
    }

    /// Enter CLOSING. The closure timestamp is recorded only once.
    pub(crate) fn mark_closing(&mut self, now: Instant) {
        if !self.state.is_terminal() {
            self.state = ConnectionState::Closing;
        }
        self.closure_time.get_or_insert(now);
    }

    /// Enter CLOSED. The closure timestamp is recorded only once.
    pub(crate) fn mark_closed(&mut self, now: Instant) {
        self.state = ConnectionState::Closed;
        self.closure_time.get_or_insert(now);
    }

    /// True once the grace period after closure has fully elapsed.
    pub fn is_reclaimable(&self, now: Instant, grace: Duration) -> bool {
        self.closure_time
            .is_some_and(|t| now.saturating_duration_since(t) >= grace)
    }
}
