//! Stack engine backed by smoltcp.
//!
//! One engine instance serves one interface. Frames from the virtual wire
//! are queued on a [`WireDevice`] and consumed by the smoltcp `Interface`
//! on the next poll; frames smoltcp emits are collected and handed to the
//! interface's frame handler after the engine lock is released.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint,
};
use tracing::{debug, info, trace, warn};

use super::frame::{ETHERNET_HDR_SIZE, build_ethernet_frame};
use super::{EngineEvent, EngineSocket, InterfaceInfo, LoopContext, StackEngine};
use crate::config::ShimConfig;
use crate::connection::SocketType;
use crate::error::{EngineError, EngineResult};

/// First port handed out to unbound connects.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Tunables for [`SmoltcpEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmoltcpConfig {
    /// Bytes per direction for every TCP socket and UDP payload ring.
    pub socket_buffer: usize,
    /// Datagram slots per direction for every UDP socket.
    pub udp_packet_slots: usize,
    /// Inbound frames queued between polls before new ones are dropped.
    pub rx_queue_depth: usize,
    /// Upper bound on open engine sockets.
    pub max_sockets: usize,
}

impl Default for SmoltcpConfig {
    fn default() -> Self {
        Self {
            socket_buffer: 64 * 1024,
            udp_packet_slots: 32,
            rx_queue_depth: 512,
            max_sockets: 1024,
        }
    }
}

impl SmoltcpConfig {
    pub fn from_shim(config: &ShimConfig) -> Self {
        Self {
            socket_buffer: config.engine_socket_buffer,
            ..Self::default()
        }
    }
}

/// Queue-backed smoltcp device standing in for the virtual wire.
struct WireDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl Device for WireDevice {
    type RxToken<'a>
        = WireRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = WireTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((WireRxToken { frame }, WireTxToken { queue: &mut self.tx }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(WireTxToken { queue: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        // smoltcp counts the Ethernet header in the MTU for this medium
        caps.max_transmission_unit = self.mtu + ETHERNET_HDR_SIZE;
        caps
    }
}

struct WireRxToken {
    frame: Vec<u8>,
}

impl RxToken for WireRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

struct WireTxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl TxToken for WireTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push_back(buffer);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpPhase {
    Idle,
    Connecting,
    Established,
    /// Peer closed or reset; reported once.
    Finished,
}

enum Entry {
    Tcp {
        handle: SocketHandle,
        local: Option<IpListenEndpoint>,
        phase: TcpPhase,
        want_write: bool,
    },
    Listener {
        endpoint: IpListenEndpoint,
        backlog: Vec<SocketHandle>,
        announced: bool,
    },
    Udp {
        handle: SocketHandle,
        peer: Option<IpEndpoint>,
        want_write: bool,
    },
}

struct EngineState {
    device: WireDevice,
    iface: Option<Interface>,
    sockets: SocketSet<'static>,
    entries: HashMap<EngineSocket, Entry>,
    /// TCP sockets closed by the owner, kept until the FIN exchange ends.
    lingering: Vec<SocketHandle>,
    next_socket: u64,
    next_port: u16,
}

impl EngineState {
    fn ensure_iface(&mut self, info: &InterfaceInfo) -> &mut Interface {
        let device = &mut self.device;
        self.iface.get_or_insert_with(|| {
            device.mtu = info.mtu() as usize;
            let mut config = Config::new(HardwareAddress::Ethernet(info.mac()));
            config.random_seed = random_seed(info);
            debug!(device = %info.device_name(), mac = %info.mac(), "Created smoltcp interface");
            Interface::new(config, device, SmolInstant::now())
        })
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX {
            EPHEMERAL_PORT_START
        } else {
            port + 1
        };
        port
    }

    fn listen_endpoint(&mut self, addr: SocketAddr) -> IpListenEndpoint {
        let port = match addr.port() {
            0 => self.ephemeral_port(),
            port => port,
        };
        let addr = (!addr.ip().is_unspecified()).then(|| IpAddress::from(addr.ip()));
        IpListenEndpoint { addr, port }
    }
}

/// Output of one poll, applied after the state lock is released.
struct PollOutcome {
    events: Vec<(EngineSocket, EngineEvent)>,
    egress: Vec<Vec<u8>>,
    delay: Duration,
}

impl PollOutcome {
    fn idle() -> Self {
        Self {
            events: Vec::new(),
            egress: Vec::new(),
            delay: Duration::MAX,
        }
    }
}

/// Stack engine running a smoltcp `Interface` over the virtual wire.
pub struct SmoltcpEngine {
    config: SmoltcpConfig,
    state: Mutex<EngineState>,
}

impl SmoltcpEngine {
    pub fn new(config: SmoltcpConfig) -> Self {
        let state = EngineState {
            device: WireDevice {
                rx: VecDeque::new(),
                tx: VecDeque::new(),
                mtu: crate::config::DEFAULT_MTU as usize,
            },
            iface: None,
            sockets: SocketSet::new(vec![]),
            entries: HashMap::new(),
            lingering: Vec::new(),
            next_socket: 1,
            next_port: EPHEMERAL_PORT_START,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn tcp_socket(&self) -> tcp::Socket<'static> {
        let n = self.config.socket_buffer;
        tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; n]),
            tcp::SocketBuffer::new(vec![0; n]),
        )
    }

    fn udp_socket(&self) -> udp::Socket<'static> {
        let n = self.config.socket_buffer;
        let slots = self.config.udp_packet_slots;
        udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; slots], vec![0; n]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; slots], vec![0; n]),
        )
    }

    /// Number of open engine sockets (listeners count once).
    pub fn socket_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Poll smoltcp once and collect what has to happen outside the lock.
    fn poll_once(&self, info: &InterfaceInfo) -> PollOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_iface(info);
        let now = SmolInstant::now();

        let EngineState {
            device,
            iface,
            sockets,
            ..
        } = &mut *state;
        let Some(iface) = iface.as_mut() else {
            return PollOutcome::idle();
        };
        let _ = iface.poll(now, device, sockets);

        let delay = if device.rx.is_empty() {
            iface
                .poll_delay(now, sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };

        state.lingering.retain(|&handle| {
            let done = matches!(
                state.sockets.get::<tcp::Socket>(handle).state(),
                tcp::State::Closed | tcp::State::TimeWait
            );
            if done {
                state.sockets.remove(handle);
            }
            !done
        });

        PollOutcome {
            events: collect_events(&mut state.entries, &mut state.sockets),
            egress: state.device.tx.drain(..).collect(),
            delay,
        }
    }
}

impl Default for SmoltcpEngine {
    fn default() -> Self {
        Self::new(SmoltcpConfig::default())
    }
}

fn random_seed(info: &InterfaceInfo) -> u64 {
    let mut mac = [0u8; 8];
    mac[..6].copy_from_slice(&info.mac().0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    u64::from_le_bytes(mac) ^ info.nwid() ^ nanos
}

fn to_cidr(net: IpNet) -> IpCidr {
    IpCidr::new(IpAddress::from(net.addr()), net.prefix_len())
}

fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(IpAddress::from(addr.ip()), addr.port())
}

fn to_socket_addr(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(IpAddr::from(ep.addr), ep.port)
}

fn rejected(e: impl std::fmt::Debug) -> EngineError {
    EngineError::Rejected(format!("{e:?}"))
}

fn collect_events(
    entries: &mut HashMap<EngineSocket, Entry>,
    sockets: &mut SocketSet<'static>,
) -> Vec<(EngineSocket, EngineEvent)> {
    let mut events = Vec::new();
    for (&sock, entry) in entries.iter_mut() {
        match entry {
            Entry::Tcp {
                handle,
                phase,
                want_write,
                ..
            } => {
                let socket = sockets.get::<tcp::Socket>(*handle);
                match *phase {
                    TcpPhase::Connecting => match socket.state() {
                        tcp::State::Established | tcp::State::CloseWait => {
                            *phase = TcpPhase::Established;
                            events.push((sock, EngineEvent::Connected));
                        }
                        tcp::State::Closed => {
                            *phase = TcpPhase::Finished;
                            events.push((sock, EngineEvent::Closed));
                            continue;
                        }
                        _ => {}
                    },
                    TcpPhase::Idle | TcpPhase::Finished => continue,
                    TcpPhase::Established => {}
                }
                if *phase != TcpPhase::Established {
                    continue;
                }
                if socket.can_recv() {
                    events.push((sock, EngineEvent::Readable));
                }
                if *want_write && socket.can_send() {
                    *want_write = false;
                    events.push((sock, EngineEvent::Writable));
                }
                if !socket.may_recv() && !socket.can_recv() {
                    *phase = TcpPhase::Finished;
                    events.push((sock, EngineEvent::Closed));
                }
            }
            Entry::Listener {
                backlog, announced, ..
            } => {
                if *announced {
                    continue;
                }
                let pending = backlog
                    .iter()
                    .any(|&h| is_accept_ready(sockets.get::<tcp::Socket>(h)));
                if pending {
                    *announced = true;
                    events.push((sock, EngineEvent::Incoming));
                }
            }
            Entry::Udp {
                handle, want_write, ..
            } => {
                let socket = sockets.get::<udp::Socket>(*handle);
                if socket.can_recv() {
                    events.push((sock, EngineEvent::Readable));
                }
                if *want_write && socket.can_send() {
                    *want_write = false;
                    events.push((sock, EngineEvent::Writable));
                }
            }
        }
    }
    events
}

fn is_accept_ready(socket: &tcp::Socket) -> bool {
    socket.is_active() && !matches!(socket.state(), tcp::State::Listen | tcp::State::SynReceived)
}

impl StackEngine for SmoltcpEngine {
    fn name(&self) -> &'static str {
        "smoltcp"
    }

    fn init_interface(&self, info: &InterfaceInfo, addr: IpNet) -> bool {
        let mut state = self.state.lock();
        let iface = state.ensure_iface(info);
        let cidr = to_cidr(addr);
        let mut accepted = false;
        iface.update_ip_addrs(|addrs| {
            accepted = addrs.iter().any(|a| *a == cidr) || addrs.push(cidr).is_ok();
        });
        if accepted {
            debug!(device = %info.device_name(), %addr, "Address registered with smoltcp");
        } else {
            warn!(device = %info.device_name(), %addr, "smoltcp address table full");
        }
        accepted
    }

    fn remove_address(&self, info: &InterfaceInfo, addr: IpNet) -> bool {
        let mut state = self.state.lock();
        let Some(iface) = state.iface.as_mut() else {
            return false;
        };
        let cidr = to_cidr(addr);
        let mut removed = false;
        iface.update_ip_addrs(|addrs| {
            let before = addrs.len();
            addrs.retain(|a| *a != cidr);
            removed = addrs.len() != before;
        });
        if removed {
            debug!(device = %info.device_name(), %addr, "Address removed from smoltcp");
        }
        removed
    }

    fn rx(
        &self,
        info: &InterfaceInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ethertype: u16,
        data: &[u8],
    ) {
        let frame = build_ethernet_frame(to, from, ethertype, data);
        let mut state = self.state.lock();
        if state.device.rx.len() >= self.config.rx_queue_depth {
            trace!(device = %info.device_name(), len = frame.len(), "RX queue full, dropping frame");
            return;
        }
        state.device.rx.push_back(frame);
    }

    fn run(&self, ctx: &LoopContext<'_>) {
        let info = ctx.interface();
        info!(device = %info.device_name(), "smoltcp engine loop started");
        while ctx.is_running() {
            let outcome = self.poll_once(info);
            for frame in &outcome.egress {
                info.send_ethernet(frame);
            }
            for (sock, event) in outcome.events {
                ctx.notify(sock, event);
            }
            ctx.tick();
            if outcome.delay > Duration::ZERO {
                ctx.wait(outcome.delay);
            }
        }
        info!(device = %info.device_name(), "smoltcp engine loop stopped");
    }

    fn open(&self, socket_type: SocketType) -> EngineResult<EngineSocket> {
        let mut state = self.state.lock();
        if state.entries.len() >= self.config.max_sockets {
            return Err(EngineError::Exhausted);
        }
        let entry = match socket_type {
            SocketType::Stream => Entry::Tcp {
                handle: state.sockets.add(self.tcp_socket()),
                local: None,
                phase: TcpPhase::Idle,
                want_write: false,
            },
            SocketType::Datagram => Entry::Udp {
                handle: state.sockets.add(self.udp_socket()),
                peer: None,
                want_write: false,
            },
            SocketType::Raw => return Err(EngineError::Unsupported),
        };
        let sock = EngineSocket(state.next_socket);
        state.next_socket += 1;
        state.entries.insert(sock, entry);
        Ok(sock)
    }

    fn connect(&self, sock: EngineSocket, remote: SocketAddr) -> EngineResult<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ephemeral = state.ephemeral_port();
        let EngineState {
            iface,
            sockets,
            entries,
            ..
        } = state;
        match entries.get_mut(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp {
                handle,
                local,
                phase,
                ..
            } => {
                let iface = iface
                    .as_mut()
                    .ok_or_else(|| EngineError::Rejected("no address configured".into()))?;
                let local = local.unwrap_or(IpListenEndpoint {
                    addr: None,
                    port: ephemeral,
                });
                sockets
                    .get_mut::<tcp::Socket>(*handle)
                    .connect(iface.context(), to_endpoint(remote), local)
                    .map_err(rejected)?;
                *phase = TcpPhase::Connecting;
                Ok(false)
            }
            Entry::Udp { handle, peer, .. } => {
                let socket = sockets.get_mut::<udp::Socket>(*handle);
                if !socket.is_open() {
                    socket
                        .bind(IpListenEndpoint {
                            addr: None,
                            port: ephemeral,
                        })
                        .map_err(rejected)?;
                }
                *peer = Some(to_endpoint(remote));
                Ok(true)
            }
            Entry::Listener { .. } => Err(EngineError::Rejected("socket is listening".into())),
        }
    }

    fn bind(&self, sock: EngineSocket, local: SocketAddr) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let endpoint = guard.listen_endpoint(local);
        let state = &mut *guard;
        match state.entries.get_mut(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp { local, .. } => {
                *local = Some(endpoint);
                Ok(())
            }
            Entry::Udp { handle, .. } => state
                .sockets
                .get_mut::<udp::Socket>(*handle)
                .bind(endpoint)
                .map_err(rejected),
            Entry::Listener { .. } => Err(EngineError::Rejected("socket is listening".into())),
        }
    }

    fn listen(&self, sock: EngineSocket, backlog: usize) -> EngineResult<()> {
        let mut state = self.state.lock();
        let (handle, endpoint) = match state.entries.get(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp {
                handle,
                local: Some(endpoint),
                phase: TcpPhase::Idle,
                ..
            } => (*handle, *endpoint),
            Entry::Tcp { .. } => return Err(EngineError::Rejected("socket is not bound".into())),
            Entry::Listener { .. } => return Ok(()),
            Entry::Udp { .. } => return Err(EngineError::Unsupported),
        };

        state
            .sockets
            .get_mut::<tcp::Socket>(handle)
            .listen(endpoint)
            .map_err(rejected)?;
        let mut handles = vec![handle];
        for _ in 1..backlog.max(1) {
            let mut socket = self.tcp_socket();
            socket.listen(endpoint).map_err(rejected)?;
            handles.push(state.sockets.add(socket));
        }
        debug!(port = endpoint.port, backlog = handles.len(), "smoltcp listening");
        state.entries.insert(
            sock,
            Entry::Listener {
                endpoint,
                backlog: handles,
                announced: false,
            },
        );
        Ok(())
    }

    fn accept(&self, sock: EngineSocket) -> EngineResult<Option<(EngineSocket, SocketAddr)>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Entry::Listener {
            endpoint,
            backlog,
            announced,
        } = state.entries.get_mut(&sock).ok_or(EngineError::UnknownSocket)?
        else {
            return Err(EngineError::Rejected("socket is not listening".into()));
        };

        let Some(pos) = backlog
            .iter()
            .position(|&h| is_accept_ready(state.sockets.get::<tcp::Socket>(h)))
        else {
            return Ok(None);
        };
        let handle = backlog.swap_remove(pos);
        *announced = false;
        let endpoint = *endpoint;

        let mut replacement = self.tcp_socket();
        match replacement.listen(endpoint) {
            Ok(()) => backlog.push(state.sockets.add(replacement)),
            Err(e) => warn!(port = endpoint.port, error = ?e, "Failed to replenish listen backlog"),
        }

        let Some(remote) = state.sockets.get::<tcp::Socket>(handle).remote_endpoint() else {
            // Reset between the readiness check and here
            state.sockets.remove(handle);
            return Ok(None);
        };

        let accepted = EngineSocket(state.next_socket);
        state.next_socket += 1;
        state.entries.insert(
            accepted,
            Entry::Tcp {
                handle,
                local: Some(endpoint),
                phase: TcpPhase::Established,
                want_write: false,
            },
        );
        Ok(Some((accepted, to_socket_addr(remote))))
    }

    fn pending_datagram(&self, sock: EngineSocket) -> EngineResult<Option<usize>> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.entries.get(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Udp { handle, .. } => Ok(state
                .sockets
                .get_mut::<udp::Socket>(*handle)
                .peek()
                .ok()
                .map(|(payload, _meta)| payload.len())),
            Entry::Tcp { .. } | Entry::Listener { .. } => Ok(None),
        }
    }

    fn read(&self, sock: EngineSocket, buf: &mut [u8]) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.entries.get(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp { handle, .. } => {
                let socket = state.sockets.get_mut::<tcp::Socket>(*handle);
                if !socket.can_recv() {
                    return Ok(0);
                }
                socket.recv_slice(buf).map_err(rejected)
            }
            Entry::Udp { handle, .. } => {
                let socket = state.sockets.get_mut::<udp::Socket>(*handle);
                if !socket.can_recv() {
                    return Ok(0);
                }
                socket.recv_slice(buf).map(|(n, _meta)| n).map_err(rejected)
            }
            Entry::Listener { .. } => Err(EngineError::Unsupported),
        }
    }

    fn write(&self, sock: EngineSocket, data: &[u8]) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.entries.get_mut(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp {
                handle,
                phase,
                want_write,
                ..
            } => {
                match *phase {
                    TcpPhase::Connecting => {
                        *want_write = true;
                        return Ok(0);
                    }
                    TcpPhase::Idle => return Err(EngineError::NotConnected),
                    TcpPhase::Finished => return Err(EngineError::Closed),
                    TcpPhase::Established => {}
                }
                let socket = state.sockets.get_mut::<tcp::Socket>(*handle);
                if !socket.may_send() {
                    return Err(EngineError::Closed);
                }
                let n = socket.send_slice(data).map_err(rejected)?;
                if n < data.len() {
                    *want_write = true;
                }
                Ok(n)
            }
            Entry::Udp {
                handle,
                peer,
                want_write,
            } => {
                let peer = peer.ok_or(EngineError::NotConnected)?;
                let socket = state.sockets.get_mut::<udp::Socket>(*handle);
                if !socket.can_send() {
                    *want_write = true;
                    return Ok(0);
                }
                socket.send_slice(data, peer).map_err(rejected)?;
                Ok(data.len())
            }
            Entry::Listener { .. } => Err(EngineError::Unsupported),
        }
    }

    fn close(&self, sock: EngineSocket) -> EngineResult<()> {
        let mut state = self.state.lock();
        match state.entries.remove(&sock).ok_or(EngineError::UnknownSocket)? {
            Entry::Tcp { handle, .. } => {
                let socket = state.sockets.get_mut::<tcp::Socket>(handle);
                if socket.is_open() {
                    socket.close();
                    state.lingering.push(handle);
                } else {
                    state.sockets.remove(handle);
                }
            }
            Entry::Listener { backlog, .. } => {
                for handle in backlog {
                    state.sockets.get_mut::<tcp::Socket>(handle).abort();
                    state.sockets.remove(handle);
                }
            }
            Entry::Udp { handle, .. } => {
                state.sockets.get_mut::<udp::Socket>(handle).close();
                state.sockets.remove(handle);
            }
        }
        Ok(())
    }
}
