//! Scripted stack engine for tests.
//!
//! Stream sockets are plain byte queues and datagram sockets are queues of
//! datagrams. Tests push inbound data, read what the shim wrote, queue
//! peers for `accept` and queue events that the loop delivers on its next
//! iteration.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;

use crate::connection::SocketType;
use crate::engine::{EngineEvent, EngineSocket, InterfaceInfo, LoopContext, StackEngine};
use crate::error::{EngineError, EngineResult};

/// Loop iteration period.
const TICK: Duration = Duration::from_millis(5);

/// A frame the engine received from the virtual wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub from: EthernetAddress,
    pub to: EthernetAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct ScriptedSocket {
    datagram: bool,
    inbound: VecDeque<u8>,
    datagrams: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
    pending: VecDeque<SocketAddr>,
    closed: bool,
}

impl ScriptedSocket {
    fn new(datagram: bool) -> Self {
        Self {
            datagram,
            inbound: VecDeque::new(),
            datagrams: VecDeque::new(),
            outbound: Vec::new(),
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    next_socket: u64,
    sockets: HashMap<EngineSocket, ScriptedSocket>,
    last_socket: Option<EngineSocket>,
    addresses: Vec<IpNet>,
    frames: Vec<ReceivedFrame>,
    events: Vec<(EngineSocket, EngineEvent)>,
    /// Outbound bytes a socket holds before `write` returns 0.
    write_limit: Option<usize>,
    closed: usize,
}

/// In-memory [`StackEngine`] driven by the test.
#[derive(Debug)]
pub struct ScriptedEngine {
    state: Mutex<ScriptedState>,
    accept_addresses: AtomicBool,
    deferred_connect: AtomicBool,
    loop_started: AtomicBool,
    loop_exited: AtomicBool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptedState::default()),
            accept_addresses: AtomicBool::new(true),
            deferred_connect: AtomicBool::new(false),
            loop_started: AtomicBool::new(false),
            loop_exited: AtomicBool::new(false),
        }
    }

    /// Whether `init_interface` accepts addresses (default true).
    pub fn set_accept_addresses(&self, accept: bool) {
        self.accept_addresses.store(accept, Ordering::SeqCst);
    }

    /// Make `connect` report completion later through an event.
    pub fn set_deferred_connect(&self, deferred: bool) {
        self.deferred_connect.store(deferred, Ordering::SeqCst);
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    pub fn addresses(&self) -> Vec<IpNet> {
        self.state.lock().addresses.clone()
    }

    pub fn received_frames(&self) -> Vec<ReceivedFrame> {
        self.state.lock().frames.clone()
    }

    /// The most recently opened or accepted socket.
    pub fn last_socket(&self) -> Option<EngineSocket> {
        self.state.lock().last_socket
    }

    /// Queue inbound bytes; on a datagram socket `data` is one datagram.
    pub fn push_inbound(&self, sock: EngineSocket, data: &[u8]) {
        if let Some(s) = self.state.lock().sockets.get_mut(&sock) {
            if s.datagram {
                s.datagrams.push_back(data.to_vec());
            } else {
                s.inbound.extend(data);
            }
        }
    }

    /// Everything the shim wrote to `sock`.
    pub fn outbound(&self, sock: EngineSocket) -> Vec<u8> {
        self.state
            .lock()
            .sockets
            .get(&sock)
            .map(|s| s.outbound.clone())
            .unwrap_or_default()
    }

    /// Queue a peer for the next `accept` on `listener`.
    pub fn queue_incoming(&self, listener: EngineSocket, from: SocketAddr) {
        if let Some(s) = self.state.lock().sockets.get_mut(&listener) {
            s.pending.push_back(from);
        }
    }

    /// Queue an event for the loop to deliver.
    pub fn queue_event(&self, sock: EngineSocket, event: EngineEvent) {
        self.state.lock().events.push((sock, event));
    }

    pub fn is_closed(&self, sock: EngineSocket) -> bool {
        self.state.lock().sockets.get(&sock).is_none_or(|s| s.closed)
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().closed
    }

    pub fn loop_started(&self) -> bool {
        self.loop_started.load(Ordering::SeqCst)
    }

    pub fn loop_exited(&self) -> bool {
        self.loop_exited.load(Ordering::SeqCst)
    }

    fn new_socket(state: &mut ScriptedState, datagram: bool) -> EngineSocket {
        state.next_socket += 1;
        let sock = EngineSocket(state.next_socket);
        state.sockets.insert(sock, ScriptedSocket::new(datagram));
        state.last_socket = Some(sock);
        sock
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StackEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn init_interface(&self, _iface: &InterfaceInfo, addr: IpNet) -> bool {
        if !self.accept_addresses.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        if !state.addresses.contains(&addr) {
            state.addresses.push(addr);
        }
        true
    }

    fn remove_address(&self, _iface: &InterfaceInfo, addr: IpNet) -> bool {
        let mut state = self.state.lock();
        let before = state.addresses.len();
        state.addresses.retain(|a| *a != addr);
        state.addresses.len() != before
    }

    fn rx(
        &self,
        _iface: &InterfaceInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ethertype: u16,
        data: &[u8],
    ) {
        self.state.lock().frames.push(ReceivedFrame {
            from,
            to,
            ethertype,
            payload: data.to_vec(),
        });
    }

    fn run(&self, ctx: &LoopContext<'_>) {
        self.loop_started.store(true, Ordering::SeqCst);
        while ctx.is_running() {
            let events = std::mem::take(&mut self.state.lock().events);
            for (sock, event) in events {
                ctx.notify(sock, event);
            }
            ctx.tick();
            ctx.wait(TICK);
        }
        self.loop_exited.store(true, Ordering::SeqCst);
    }

    fn open(&self, socket_type: SocketType) -> EngineResult<EngineSocket> {
        if socket_type == SocketType::Raw {
            return Err(EngineError::Unsupported);
        }
        let datagram = socket_type == SocketType::Datagram;
        Ok(Self::new_socket(&mut self.state.lock(), datagram))
    }

    fn connect(&self, sock: EngineSocket, _remote: SocketAddr) -> EngineResult<bool> {
        if !self.state.lock().sockets.contains_key(&sock) {
            return Err(EngineError::UnknownSocket);
        }
        Ok(!self.deferred_connect.load(Ordering::SeqCst))
    }

    fn bind(&self, sock: EngineSocket, _local: SocketAddr) -> EngineResult<()> {
        match self.state.lock().sockets.get(&sock) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownSocket),
        }
    }

    fn listen(&self, sock: EngineSocket, _backlog: usize) -> EngineResult<()> {
        match self.state.lock().sockets.get(&sock) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownSocket),
        }
    }

    fn accept(&self, sock: EngineSocket) -> EngineResult<Option<(EngineSocket, SocketAddr)>> {
        let mut state = self.state.lock();
        let listener = state.sockets.get_mut(&sock).ok_or(EngineError::UnknownSocket)?;
        let Some(from) = listener.pending.pop_front() else {
            return Ok(None);
        };
        let accepted = Self::new_socket(&mut state, false);
        Ok(Some((accepted, from)))
    }

    fn pending_datagram(&self, sock: EngineSocket) -> EngineResult<Option<usize>> {
        let state = self.state.lock();
        let s = state.sockets.get(&sock).ok_or(EngineError::UnknownSocket)?;
        Ok(s.datagrams.front().map(Vec::len))
    }

    fn read(&self, sock: EngineSocket, buf: &mut [u8]) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let s = state.sockets.get_mut(&sock).ok_or(EngineError::UnknownSocket)?;
        if s.datagram {
            let Some(datagram) = s.datagrams.pop_front() else {
                return Ok(0);
            };
            // A datagram that does not fit is lost, as in smoltcp
            if datagram.len() > buf.len() {
                return Err(EngineError::Rejected("datagram truncated".into()));
            }
            buf[..datagram.len()].copy_from_slice(&datagram);
            return Ok(datagram.len());
        }
        let n = buf.len().min(s.inbound.len());
        for (dst, src) in buf.iter_mut().zip(s.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, sock: EngineSocket, data: &[u8]) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let limit = state.write_limit;
        let s = state.sockets.get_mut(&sock).ok_or(EngineError::UnknownSocket)?;
        if s.closed {
            return Err(EngineError::Closed);
        }
        let room = limit.map_or(data.len(), |l| l.saturating_sub(s.outbound.len()));
        let n = data.len().min(room);
        s.outbound.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&self, sock: EngineSocket) -> EngineResult<()> {
        let mut state = self.state.lock();
        let s = state.sockets.get_mut(&sock).ok_or(EngineError::UnknownSocket)?;
        if s.closed {
            return Err(EngineError::Closed);
        }
        s.closed = true;
        state.closed += 1;
        Ok(())
    }
}
