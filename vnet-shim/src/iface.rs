//! Virtual network interface: one per joined network.
//!
//! The interface owns the address set, multicast tracker and connection
//! table of its network, plus a named thread running the stack engine's
//! loop. Applications drive it through the socket API (`open`, `connect`,
//! `bind`, `listen`, `accept`, `read`, `write`, `close`); the virtual wire
//! feeds it frames through [`VirtualInterface::put`]; the reactor reports
//! local socket activity through the `on_local_*` callbacks.
//!
//! Locking: the connection table lock is taken before any engine call that
//! needs it, never the other way round. Calls into the reactor bridge and
//! the frame handler are made with no lock held.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use ipnet::IpNet;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use tracing::{debug, info, trace, warn};

use crate::addr::AddressSet;
use crate::bridge::{LocalSocket, NullBridge, ReactorBridge, ReactorEvent};
use crate::config::ShimConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState, SocketType};
use crate::engine::frame::{ETHERNET_HDR_SIZE, FrameHandler, discard_frames, split_frame};
use crate::engine::{EngineEvent, EngineSocket, EventSink, InterfaceInfo, LoopContext, StackEngine};
use crate::error::{Result, ShimError};
use crate::multicast::{MulticastDelta, MulticastGroup, MulticastTracker};
use crate::registry::ShimRegistry;
use crate::table::ConnectionTable;

/// Initial size of the engine read buffer; grows for larger datagrams.
const READ_CHUNK: usize = 16 * 1024;

/// Builder for [`VirtualInterface`].
pub struct VirtualInterfaceBuilder {
    nwid: u64,
    mac: EthernetAddress,
    home_path: PathBuf,
    mtu: Option<u32>,
    metric: u32,
    engine: Option<Arc<dyn StackEngine>>,
    bridge: Arc<dyn ReactorBridge>,
    frame_handler: FrameHandler,
    config: ShimConfig,
    registry: Option<Arc<ShimRegistry>>,
}

impl VirtualInterfaceBuilder {
    /// Directory holding per-network state of the embedding service.
    pub fn home_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.home_path = path.into();
        self
    }

    /// Override the configured default MTU.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Route metric reported for the interface.
    pub fn metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    /// Stack engine serving this interface. Without one every socket call
    /// fails with [`ShimError::EngineUnavailable`].
    pub fn engine(mut self, engine: Arc<dyn StackEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Reactor owning the application-facing local sockets.
    pub fn bridge(mut self, bridge: Arc<dyn ReactorBridge>) -> Self {
        self.bridge = bridge;
        self
    }

    /// Callback placing outgoing frames on the virtual wire.
    pub fn frame_handler(mut self, handler: FrameHandler) -> Self {
        self.frame_handler = handler;
        self
    }

    /// Policy constants; validated by [`build`](Self::build).
    pub fn config(mut self, config: ShimConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a private registry instead of [`ShimRegistry::global`].
    pub fn registry(mut self, registry: Arc<ShimRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Create the interface, register it and start its loop thread.
    pub fn build(self) -> Result<Arc<VirtualInterface>> {
        self.config.validate()?;
        let registry = self.registry.unwrap_or_else(ShimRegistry::global);
        let device_name = registry.next_device_name(&self.config.device_prefix);
        let mtu = self.mtu.unwrap_or(self.config.default_mtu);
        let info = Arc::new(InterfaceInfo::new(
            self.nwid,
            device_name.clone(),
            self.mac,
            mtu,
            self.frame_handler,
        ));
        let (wake_tx, wake_rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));

        let iface = Arc::new(VirtualInterface {
            info: info.clone(),
            home_path: self.home_path,
            metric: self.metric,
            config: self.config,
            engine: self.engine,
            bridge: self.bridge,
            registry,
            addrs: AddressSet::new(),
            multicast: MulticastTracker::new(),
            table: Mutex::new(ConnectionTable::new()),
            enabled: AtomicBool::new(true),
            running: running.clone(),
            wake_tx,
            listen_socket: Mutex::new(None),
            read_buf: Mutex::new(vec![0u8; READ_CHUNK]),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let sink = LoopSink {
            iface: Arc::downgrade(&iface),
        };
        let engine = iface.engine.clone();
        let max_wait = iface.config.max_poll_interval;
        let handle = thread::Builder::new()
            .name(device_name.clone())
            .spawn(move || {
                let ctx = LoopContext::new(&info, &running, &wake_rx, &sink, max_wait);
                match engine {
                    Some(engine) => engine.run(&ctx),
                    None => idle_loop(&ctx),
                }
                debug!(device = %info.device_name(), "Interface loop exited");
            })
            .map_err(|e| ShimError::Spawn(e.to_string()))?;
        *iface.worker.lock() = Some(handle);

        iface.registry.register(&iface);
        info!(
            nwid = %format_args!("{:016x}", iface.nwid()),
            device = %device_name,
            mac = %iface.mac(),
            mtu,
            engine = iface.engine.as_ref().map_or("none", |e| e.name()),
            "Virtual interface started"
        );
        Ok(iface)
    }
}

/// Loop used when no engine is configured: housekeeping only.
fn idle_loop(ctx: &LoopContext<'_>) {
    while ctx.is_running() {
        ctx.tick();
        ctx.wait(Duration::MAX);
    }
}

/// Forwards loop callbacks to the interface while it is alive.
struct LoopSink {
    iface: Weak<VirtualInterface>,
}

impl EventSink for LoopSink {
    fn on_engine_event(&self, sock: EngineSocket, event: EngineEvent) {
        if let Some(iface) = self.iface.upgrade() {
            iface.on_engine_event(sock, event);
        }
    }

    fn on_tick(&self) {
        if let Some(iface) = self.iface.upgrade() {
            iface.run_housekeeping();
        }
    }
}

/// The socket shim for one virtual network.
pub struct VirtualInterface {
    info: Arc<InterfaceInfo>,
    home_path: PathBuf,
    metric: u32,
    config: ShimConfig,
    engine: Option<Arc<dyn StackEngine>>,
    bridge: Arc<dyn ReactorBridge>,
    registry: Arc<ShimRegistry>,
    addrs: AddressSet,
    multicast: MulticastTracker,
    table: Mutex<ConnectionTable>,
    enabled: AtomicBool,
    running: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    /// Local listening socket closed at teardown.
    listen_socket: Mutex<Option<LocalSocket>>,
    /// Scratch space for engine reads; only taken under the table lock.
    read_buf: Mutex<Vec<u8>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl VirtualInterface {
    /// Start building an interface for network `nwid` with hardware
    /// address `mac`. Defaults: no engine, [`NullBridge`], frames dropped,
    /// default [`ShimConfig`], global registry.
    pub fn builder(nwid: u64, mac: EthernetAddress) -> VirtualInterfaceBuilder {
        VirtualInterfaceBuilder {
            nwid,
            mac,
            home_path: PathBuf::new(),
            mtu: None,
            metric: 0,
            engine: None,
            bridge: Arc::new(NullBridge),
            frame_handler: discard_frames(),
            config: ShimConfig::default(),
            registry: None,
        }
    }

    /// Network id this interface belongs to.
    pub fn nwid(&self) -> u64 {
        self.info.nwid()
    }

    /// Device name assigned at construction (`vnet0`, `vnet1`, ...).
    pub fn device_name(&self) -> &str {
        self.info.device_name()
    }

    /// Hardware address on the virtual wire.
    pub fn mac(&self) -> EthernetAddress {
        self.info.mac()
    }

    /// Current MTU.
    pub fn mtu(&self) -> u32 {
        self.info.mtu()
    }

    /// Takes effect for engine interfaces created afterwards.
    pub fn set_mtu(&self, mtu: u32) {
        self.info.set_mtu(mtu);
    }

    /// Route metric given at construction.
    pub fn metric(&self) -> u32 {
        self.metric
    }

    /// Home path given at construction; empty if none was set.
    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    /// Policy constants in effect.
    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    /// The view of this interface handed to the stack engine.
    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    /// False while frames from the virtual wire are dropped.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// A disabled interface drops frames from the virtual wire.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Accepted for API parity; the name is only logged.
    pub fn set_friendly_name(&self, name: &str) {
        info!(device = %self.device_name(), friendly_name = name, "Friendly name set");
    }

    /// Local listening socket to close when the interface is torn down.
    pub fn set_listen_socket(&self, sock: LocalSocket) {
        *self.listen_socket.lock() = Some(sock);
    }

    /// True while the loop thread has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn engine(&self) -> Result<&Arc<dyn StackEngine>> {
        self.engine.as_ref().ok_or(ShimError::EngineUnavailable)
    }

    fn wake_loop(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Register `addr` with the engine and add it to the address set.
    ///
    /// Returns false, leaving the set untouched, if there is no engine or
    /// the engine refuses the address.
    pub fn add_ip(&self, addr: IpNet) -> bool {
        let Some(engine) = self.engine.as_ref() else {
            warn!(device = %self.device_name(), %addr, "No stack engine, address not added");
            return false;
        };
        if !engine.init_interface(&self.info, addr) {
            warn!(device = %self.device_name(), %addr, engine = engine.name(), "Engine rejected address");
            return false;
        }
        if self.addrs.insert(addr) {
            info!(device = %self.device_name(), %addr, "Address added");
        }
        true
    }

    /// Remove `addr` from the address set and de-register it from the
    /// engine. Returns false if the address was not present.
    pub fn remove_ip(&self, addr: IpNet) -> bool {
        if !self.addrs.remove(&addr) {
            return false;
        }
        if let Some(engine) = self.engine.as_ref()
            && !engine.remove_address(&self.info, addr)
        {
            warn!(device = %self.device_name(), %addr, "Engine did not know the removed address");
        }
        info!(device = %self.device_name(), %addr, "Address removed");
        true
    }

    /// Snapshot of the bound addresses, sorted.
    pub fn ips(&self) -> Vec<IpNet> {
        self.addrs.snapshot()
    }

    /// Recompute multicast memberships from the current addresses.
    pub fn scan_multicast_groups(&self) -> MulticastDelta {
        let delta = self.multicast.scan(&self.ips());
        if !delta.is_empty() {
            debug!(
                device = %self.device_name(),
                added = delta.added.len(),
                removed = delta.removed.len(),
                "Multicast groups changed"
            );
        }
        delta
    }

    /// Groups tracked since the last scan, sorted.
    pub fn multicast_groups(&self) -> Vec<MulticastGroup> {
        self.multicast.groups()
    }

    /// Deliver one frame from the virtual wire to the engine.
    pub fn put(&self, from: EthernetAddress, to: EthernetAddress, ethertype: u16, data: &[u8]) {
        if !self.enabled() {
            trace!(device = %self.device_name(), "Interface disabled, dropping frame");
            return;
        }
        match self.engine.as_ref() {
            Some(engine) => {
                trace!(device = %self.device_name(), %from, %to, ethertype, len = data.len(), "Frame from wire");
                engine.rx(&self.info, from, to, ethertype, data);
                self.wake_loop();
            }
            None => trace!(device = %self.device_name(), "No stack engine, dropping frame"),
        }
    }

    /// Create a connection, with an engine socket unless `socket_type` is
    /// raw.
    pub fn open(&self, socket_type: SocketType, local: Option<LocalSocket>) -> Result<ConnectionId> {
        let mut table = self.table.lock();
        let engine_socket = if socket_type.uses_engine() {
            Some(self.engine()?.open(socket_type)?)
        } else {
            None
        };
        let (rx, tx) = (self.config.rx_buffer_size, self.config.tx_buffer_size);
        let id = table.insert_with(|id| Connection::new(id, socket_type, engine_socket, local, rx, tx));
        debug!(device = %self.device_name(), conn = %id, %socket_type, "Connection opened");
        Ok(id)
    }

    /// Associate a local socket with a connection, typically after
    /// `accept`. Inbound bytes staged so far are pushed to it.
    ///
    /// If the peer already closed, the socket still receives what is
    /// staged and is closed through the bridge once that has drained; with
    /// nothing staged it is closed right away.
    pub fn attach_local(&self, id: ConnectionId, sock: LocalSocket) -> Result<()> {
        let close_now = {
            let mut table = self.table.lock();
            let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
            let closed = conn.state().is_terminal();
            if closed && conn.rx.is_empty() {
                true
            } else {
                conn.set_local(sock);
                conn.close_local_pending |= closed;
                false
            }
        };
        if close_now {
            debug!(device = %self.device_name(), conn = %id, %sock, "Attached to closed connection, closing local socket");
            self.bridge.close_local(sock);
            return Ok(());
        }
        self.push_rx(id)?;
        Ok(())
    }

    /// State of `id`, or `None` once it has been released.
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.table.lock().get(id).map(|c| c.state())
    }

    /// Connections in the table, including ones waiting out their grace
    /// period.
    pub fn connection_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Run a housekeeping pass now. Returns how many connections were
    /// released.
    pub fn housekeeping(&self) -> usize {
        let released = self
            .table
            .lock()
            .housekeep(Instant::now(), self.config.connection_grace_period);
        released.len()
    }

    /// Periodic housekeeping driven from the loop thread.
    fn run_housekeeping(&self) {
        let released = self.table.lock().housekeep_if_due(
            Instant::now(),
            self.config.housekeeping_interval,
            self.config.connection_grace_period,
        );
        if let Some(released) = released
            && !released.is_empty()
        {
            trace!(device = %self.device_name(), count = released.len(), "Housekeeping released connections");
        }
    }

    /// Look up `id`, check it is in one of `allowed`, and return its engine
    /// socket.
    fn engine_socket_in(
        table: &ConnectionTable,
        id: ConnectionId,
        op: &'static str,
        allowed: &[ConnectionState],
    ) -> Result<EngineSocket> {
        let conn = table.get(id).ok_or(ShimError::InvalidConnection(id))?;
        if !allowed.contains(&conn.state()) {
            return Err(ShimError::InvalidState {
                id,
                state: conn.state(),
                op,
            });
        }
        conn.engine_socket()
            .ok_or(ShimError::Engine(crate::error::EngineError::Unsupported))
    }

    /// Start a connection to `remote`.
    ///
    /// The table lock is held across the engine call.
    pub fn connect(&self, id: ConnectionId, remote: SocketAddr) -> Result<()> {
        let engine = self.engine()?;
        let mut table = self.table.lock();
        let sock = Self::engine_socket_in(
            &table,
            id,
            "connect",
            &[ConnectionState::Unbound, ConnectionState::Bound],
        )?;
        let connected = engine.connect(sock, remote)?;
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        };
        if let Some(conn) = table.get_mut(id) {
            conn.set_state(state);
        }
        drop(table);
        self.wake_loop();
        debug!(device = %self.device_name(), conn = %id, %remote, %state, "Connect");
        Ok(())
    }

    /// Bind an unbound connection to a local address.
    pub fn bind(&self, id: ConnectionId, local: SocketAddr) -> Result<()> {
        let engine = self.engine()?;
        let mut table = self.table.lock();
        let sock = Self::engine_socket_in(&table, id, "bind", &[ConnectionState::Unbound])?;
        engine.bind(sock, local)?;
        if let Some(conn) = table.get_mut(id) {
            conn.set_state(ConnectionState::Bound);
        }
        debug!(device = %self.device_name(), conn = %id, %local, "Bind");
        Ok(())
    }

    /// Start accepting peers on a bound connection.
    pub fn listen(&self, id: ConnectionId, backlog: usize) -> Result<()> {
        let engine = self.engine()?;
        let mut table = self.table.lock();
        let sock = Self::engine_socket_in(&table, id, "listen", &[ConnectionState::Bound])?;
        engine.listen(sock, backlog)?;
        if let Some(conn) = table.get_mut(id) {
            conn.set_state(ConnectionState::Listening);
        }
        debug!(device = %self.device_name(), conn = %id, backlog, "Listen");
        Ok(())
    }

    /// Take one pending peer from a listening connection. The new
    /// connection starts CONNECTED with no local socket attached.
    pub fn accept(&self, id: ConnectionId) -> Result<Option<ConnectionId>> {
        let engine = self.engine()?;
        let mut table = self.table.lock();
        let sock = Self::engine_socket_in(&table, id, "accept", &[ConnectionState::Listening])?;
        let Some((accepted, peer)) = engine.accept(sock)? else {
            return Ok(None);
        };
        let (rx, tx) = (self.config.rx_buffer_size, self.config.tx_buffer_size);
        let new_id = table.insert_with(|new_id| {
            let mut conn = Connection::new(new_id, SocketType::Stream, Some(accepted), None, rx, tx);
            conn.set_state(ConnectionState::Connected);
            conn
        });
        debug!(device = %self.device_name(), listener = %id, conn = %new_id, %peer, "Accepted");
        Ok(Some(new_id))
    }

    /// Pull inbound bytes from the engine and push them to the local socket.
    ///
    /// Returns the number of bytes the local socket took. Bytes it did not
    /// take stay staged for the next writable callback. After a peer close
    /// only the staged bytes are delivered.
    pub fn read(&self, id: ConnectionId) -> Result<usize> {
        let engine = self.engine()?;
        let pulled = {
            let mut table = self.table.lock();
            let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
            if conn.state().is_terminal() {
                if conn.rx.is_empty() {
                    return Err(ShimError::InvalidState {
                        id,
                        state: conn.state(),
                        op: "read",
                    });
                }
                0
            } else if let Some(sock) = conn.engine_socket() {
                let mut buf = self.read_buf.lock();
                pull_from_engine(engine.as_ref(), sock, conn, &mut buf)?
            } else {
                0
            }
        };
        if pulled > 0 {
            trace!(device = %self.device_name(), conn = %id, pulled, "Pulled from engine");
            // Window update
            self.wake_loop();
        }
        self.push_rx(id)
    }

    /// Write staged inbound bytes to the local socket, outside the lock.
    ///
    /// Streams go out as one chunk; datagrams one per bridge write, each
    /// either taken whole or left staged. Once a peer-closed connection has
    /// drained, its local socket is closed.
    fn push_rx(&self, id: ConnectionId) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let (local, chunk, datagram) = {
                let mut table = self.table.lock();
                let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
                if conn.rx_in_flight {
                    return Ok(delivered);
                }
                let Some(local) = conn.local() else {
                    return Ok(delivered);
                };
                if conn.rx.is_empty() {
                    let finish = std::mem::take(&mut conn.close_local_pending);
                    drop(table);
                    if finish {
                        debug!(device = %self.device_name(), conn = %id, %local, "Staged data delivered, closing local socket");
                        self.bridge.close_local(local);
                    }
                    return Ok(delivered);
                }
                conn.rx_in_flight = true;
                match conn.rx_datagrams.pop_front() {
                    Some(len) => (local, conn.rx.take_front(len), true),
                    None => (local, conn.rx.take(), false),
                }
            };

            let written = self.bridge.write_local(local, &chunk);

            let mut table = self.table.lock();
            // Released by teardown while the lock was dropped
            let Some(conn) = table.get_mut(id) else {
                return Ok(delivered);
            };
            conn.rx_in_flight = false;
            match written {
                Ok(0) => {
                    conn.rx.unshift(&chunk);
                    if datagram {
                        conn.rx_datagrams.push_front(chunk.len());
                    }
                    return Ok(delivered);
                }
                Ok(n) if datagram => {
                    if n < chunk.len() {
                        debug!(device = %self.device_name(), conn = %id, len = chunk.len(), taken = n, "Local socket truncated datagram");
                    }
                    delivered += n.min(chunk.len());
                }
                Ok(n) => {
                    let n = n.min(chunk.len());
                    conn.rx.unshift(&chunk[n..]);
                    delivered += n;
                    if n < chunk.len() {
                        return Ok(delivered);
                    }
                }
                Err(e) => {
                    conn.rx.unshift(&chunk);
                    if datagram {
                        conn.rx_datagrams.push_front(chunk.len());
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Send application bytes.
    ///
    /// Raw connections take one complete Ethernet frame and put it on the
    /// virtual wire without the engine. Stream connections stage the bytes
    /// and flush what the engine accepts; datagram connections hand `data`
    /// to the engine as one datagram. Returns the number of bytes taken.
    pub fn write(&self, id: ConnectionId, data: &[u8]) -> Result<usize> {
        self.write_inner(id, data, false)
    }

    /// `write` for bytes already read from a local socket. Stream bytes are
    /// staged in full, and reads on the local socket are paused while the
    /// TX staging buffer is over capacity.
    fn write_inner(&self, id: ConnectionId, data: &[u8], from_local: bool) -> Result<usize> {
        let socket_type = self.table.lock().get(id).map(|c| c.socket_type());
        if socket_type == Some(SocketType::Raw) {
            return self.write_raw(id, data);
        }
        let engine = self.engine()?;
        let socket_type = socket_type.ok_or(ShimError::InvalidConnection(id))?;

        let mut table = self.table.lock();
        let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
        let state = conn.state();
        let writable = match socket_type {
            SocketType::Stream => matches!(state, ConnectionState::Connecting | ConnectionState::Connected),
            _ => !state.is_terminal(),
        };
        if !writable {
            return Err(ShimError::InvalidState { id, state, op: "write" });
        }
        let sock = conn
            .engine_socket()
            .ok_or(ShimError::Engine(crate::error::EngineError::Unsupported))?;

        let mut pause = None;
        let taken = if socket_type == SocketType::Datagram {
            engine.write(sock, data)?
        } else {
            let taken = if from_local {
                conn.tx.push_all(data)
            } else {
                conn.tx.push(data)
            };
            flush_tx(engine.as_ref(), sock, conn)?;
            if from_local && conn.tx.is_full() && !conn.local_read_paused {
                conn.local_read_paused = true;
                pause = conn.local();
            }
            taken
        };
        drop(table);
        if let Some(local) = pause {
            debug!(device = %self.device_name(), conn = %id, %local, "TX staging full, pausing local reads");
            self.bridge.set_read_paused(local, true);
        }
        self.wake_loop();
        trace!(device = %self.device_name(), conn = %id, taken, "Write");
        Ok(taken)
    }

    fn write_raw(&self, id: ConnectionId, data: &[u8]) -> Result<usize> {
        {
            let table = self.table.lock();
            let conn = table.get(id).ok_or(ShimError::InvalidConnection(id))?;
            if conn.state().is_terminal() {
                return Err(ShimError::InvalidState {
                    id,
                    state: conn.state(),
                    op: "write",
                });
            }
        }
        if data.len() < ETHERNET_HDR_SIZE {
            warn!(device = %self.device_name(), conn = %id, len = data.len(), "Raw write shorter than an Ethernet header");
            return Err(ShimError::MalformedFrame { len: data.len() });
        }
        let frame = split_frame(self.nwid(), data).ok_or(ShimError::MalformedFrame { len: data.len() })?;
        trace!(device = %self.device_name(), conn = %id, ethertype = frame.ethertype, len = frame.payload.len(), "Raw frame to wire");
        self.info.send(&frame);
        Ok(data.len())
    }

    /// Close a connection.
    ///
    /// A LISTENING connection never had a local socket wrapped, so only the
    /// engine side is closed. Otherwise the local socket is closed through
    /// the bridge as well. The connection stays in the table, CLOSING, until
    /// housekeeping releases it. Closing twice is a no-op.
    pub fn close(&self, id: ConnectionId) -> Result<()> {
        self.close_connection(id, true)
    }

    fn close_connection(&self, id: ConnectionId, close_local: bool) -> Result<()> {
        let (local, listening) = {
            let mut table = self.table.lock();
            let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
            if conn.state().is_terminal() {
                // Peer closed earlier and staged bytes are still waiting:
                // the application gives up on them.
                if !std::mem::take(&mut conn.close_local_pending) {
                    return Ok(());
                }
                conn.rx.clear();
                conn.rx_datagrams.clear();
                let local = conn.local().filter(|_| close_local);
                drop(table);
                if let Some(local) = local {
                    self.bridge.close_local(local);
                }
                debug!(device = %self.device_name(), conn = %id, "Discarded undelivered data on close");
                return Ok(());
            }
            let listening = conn.state() == ConnectionState::Listening;
            if let (Some(sock), Some(engine)) = (conn.engine_socket(), self.engine.as_ref())
                && let Err(e) = engine.close(sock)
            {
                debug!(device = %self.device_name(), conn = %id, error = %e, "Engine close failed");
            }
            conn.mark_closing(Instant::now());
            (conn.local(), listening)
        };
        if !listening
            && close_local
            && let Some(local) = local
        {
            self.bridge.close_local(local);
        }
        self.wake_loop();
        debug!(device = %self.device_name(), conn = %id, listening, "Closed");
        Ok(())
    }

    /// Handle a readiness event reported by the engine loop.
    pub fn on_engine_event(&self, sock: EngineSocket, event: EngineEvent) {
        let Some(id) = self.table.lock().lookup_engine(sock) else {
            trace!(device = %self.device_name(), %sock, ?event, "Event for unknown engine socket");
            return;
        };
        let result = match event {
            EngineEvent::Readable => self.read(id).map(|_| ()),
            EngineEvent::Writable => self.flush(id),
            EngineEvent::Connected => {
                let mut table = self.table.lock();
                if let Some(conn) = table.get_mut(id)
                    && conn.state() == ConnectionState::Connecting
                {
                    conn.set_state(ConnectionState::Connected);
                    debug!(device = %self.device_name(), conn = %id, "Connected");
                }
                Ok(())
            }
            EngineEvent::Incoming => {
                debug!(device = %self.device_name(), conn = %id, "Incoming connection pending");
                Ok(())
            }
            EngineEvent::Closed => {
                debug!(device = %self.device_name(), conn = %id, "Closed by peer");
                self.peer_closed(id)
            }
        };
        if let Err(e) = result {
            debug!(device = %self.device_name(), conn = %id, ?event, error = %e, "Engine event not handled");
        }
    }

    /// The peer closed or reset the connection.
    ///
    /// Inbound bytes still in the engine are pulled first. The connection
    /// becomes CLOSING at once, but its local socket is only closed after
    /// everything staged has reached it.
    fn peer_closed(&self, id: ConnectionId) -> Result<()> {
        let close_now = {
            let mut table = self.table.lock();
            let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
            if conn.state().is_terminal() {
                return Ok(());
            }
            let listening = conn.state() == ConnectionState::Listening;
            if let (Some(sock), Some(engine)) = (conn.engine_socket(), self.engine.as_ref()) {
                if !listening {
                    let mut buf = self.read_buf.lock();
                    if let Err(e) = pull_from_engine(engine.as_ref(), sock, conn, &mut buf) {
                        debug!(device = %self.device_name(), conn = %id, error = %e, "Final pull failed");
                    }
                }
                if let Err(e) = engine.close(sock) {
                    debug!(device = %self.device_name(), conn = %id, error = %e, "Engine close failed");
                }
            }
            conn.mark_closing(Instant::now());
            match conn.local() {
                Some(local) if !listening && conn.rx.is_empty() => Some(local),
                Some(_) if !listening => {
                    conn.close_local_pending = true;
                    None
                }
                _ => None,
            }
        };
        match close_now {
            Some(local) => self.bridge.close_local(local),
            None => {
                self.push_rx(id)?;
            }
        }
        self.wake_loop();
        Ok(())
    }

    /// Push staged outbound bytes into the engine, resuming local reads
    /// once the TX staging buffer has room again.
    fn flush(&self, id: ConnectionId) -> Result<()> {
        let engine = self.engine()?;
        let mut table = self.table.lock();
        let conn = table.get_mut(id).ok_or(ShimError::InvalidConnection(id))?;
        let Some(sock) = conn.engine_socket() else {
            return Ok(());
        };
        let flushed = flush_tx(engine.as_ref(), sock, conn)?;
        let resume = if conn.local_read_paused && !conn.tx.is_full() {
            conn.local_read_paused = false;
            conn.local()
        } else {
            None
        };
        drop(table);
        if let Some(local) = resume {
            debug!(device = %self.device_name(), conn = %id, %local, "TX staging drained, resuming local reads");
            self.bridge.set_read_paused(local, false);
        }
        if flushed > 0 {
            self.wake_loop();
        }
        Ok(())
    }

    /// The application closed its local socket.
    pub fn on_local_close(&self, sock: LocalSocket, conn: Option<ConnectionId>) {
        let Some(id) = conn else {
            return;
        };
        trace!(device = %self.device_name(), %sock, conn = %id, "Local close");
        if let Err(e) = self.close_connection(id, false) {
            debug!(device = %self.device_name(), conn = %id, error = %e, "Close after local close failed");
        }
    }

    /// The application wrote to its local socket.
    pub fn on_local_data(&self, sock: LocalSocket, conn: Option<ConnectionId>, data: &[u8]) {
        let Some(id) = conn else {
            return;
        };
        if data.is_empty() {
            return;
        }
        match self.write_inner(id, data, true) {
            Ok(n) if n < data.len() => {
                debug!(device = %self.device_name(), %sock, conn = %id, taken = n, len = data.len(), "Short write")
            }
            Ok(_) => {}
            Err(e) => warn!(device = %self.device_name(), %sock, conn = %id, error = %e, "Write failed"),
        }
    }

    /// The local socket can take more inbound bytes.
    pub fn on_local_writable(&self, sock: LocalSocket, conn: Option<ConnectionId>) {
        let Some(id) = conn else {
            return;
        };
        if let Err(e) = self.read(id) {
            debug!(device = %self.device_name(), %sock, conn = %id, error = %e, "Read on writable failed");
        }
    }

    /// Dispatch a reactor event. Only local close, data and writable
    /// events act; the rest belong to the engine or the application.
    pub fn on_reactor_event(&self, event: &ReactorEvent) {
        match event {
            ReactorEvent::LocalClose { sock, conn } => self.on_local_close(*sock, *conn),
            ReactorEvent::LocalData { sock, conn, data } => self.on_local_data(*sock, *conn, data),
            ReactorEvent::LocalWritable { sock, conn } => self.on_local_writable(*sock, *conn),
            ReactorEvent::Datagram { .. }
            | ReactorEvent::TcpConnect { .. }
            | ReactorEvent::TcpAccept { .. }
            | ReactorEvent::TcpClose { .. }
            | ReactorEvent::TcpData { .. }
            | ReactorEvent::TcpWritable { .. } => {}
        }
    }

    /// Stop the loop, close the listening socket, release every connection
    /// and leave the registry. Runs once; `Drop` calls it too.
    ///
    /// Socket calls must not race with shutdown.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(nwid = %format_args!("{:016x}", self.nwid()), device = %self.device_name(), "Stopping virtual interface");

        self.running.store(false, Ordering::Release);
        self.wake_loop();
        self.bridge.wake();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Last reference dropped inside a loop callback; the loop
                // sees the stop flag when the callback returns.
                debug!(device = %self.device_name(), "Teardown on loop thread, not joining");
            } else if handle.join().is_err() {
                warn!(device = %self.device_name(), "Interface loop panicked");
            }
        }

        if let Some(sock) = self.listen_socket.lock().take() {
            self.bridge.close_local(sock);
        }

        let drained = self.table.lock().drain();
        for conn in &drained {
            if conn.state().is_terminal() {
                // Peer-closed with undelivered data
                if conn.close_local_pending
                    && let Some(local) = conn.local()
                {
                    self.bridge.close_local(local);
                }
                continue;
            }
            if let (Some(sock), Some(engine)) = (conn.engine_socket(), self.engine.as_ref()) {
                let _ = engine.close(sock);
            }
            if conn.state() != ConnectionState::Listening
                && let Some(local) = conn.local()
            {
                self.bridge.close_local(local);
            }
        }
        debug!(device = %self.device_name(), released = drained.len(), "Connections released");

        self.registry.unregister(self);
    }
}

impl Drop for VirtualInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move pending inbound data from the engine into the RX staging buffer.
///
/// Datagrams are pulled whole: one larger than the free staging space stays
/// queued in the engine, and `buf` grows to fit the largest one seen.
fn pull_from_engine(
    engine: &dyn StackEngine,
    sock: EngineSocket,
    conn: &mut Connection,
    buf: &mut Vec<u8>,
) -> Result<usize> {
    let mut pulled = 0;
    if conn.socket_type() == SocketType::Datagram {
        while let Some(len) = engine.pending_datagram(sock)? {
            let oversized = len > conn.rx.free() && conn.rx.is_empty();
            if len > conn.rx.free() && !oversized {
                break;
            }
            if buf.len() < len {
                buf.resize(len, 0);
            }
            let n = engine.read(sock, &mut buf[..len])?;
            if oversized {
                warn!(conn = %conn.id(), %sock, len = n, "Datagram larger than RX buffer, dropped");
                continue;
            }
            if n > 0 {
                conn.rx.push(&buf[..n]);
                conn.rx_datagrams.push_back(n);
                pulled += n;
            }
        }
        return Ok(pulled);
    }
    while conn.rx.free() > 0 {
        let want = conn.rx.free().min(buf.len());
        let n = engine.read(sock, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        conn.rx.push(&buf[..n]);
        pulled += n;
    }
    Ok(pulled)
}

/// Move staged TX bytes into the engine until it stops taking them.
fn flush_tx(engine: &dyn StackEngine, sock: EngineSocket, conn: &mut Connection) -> Result<usize> {
    let mut flushed = 0;
    while !conn.tx.is_empty() {
        let n = engine.write(sock, conn.tx.as_slice())?;
        if n == 0 {
            break;
        }
        conn.tx.consume(n);
        flushed += n;
    }
    Ok(flushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingBridge, ScriptedEngine, frame_recorder, test_mac};

    fn build(engine: Option<Arc<ScriptedEngine>>, bridge: Arc<RecordingBridge>) -> Arc<VirtualInterface> {
        let mut builder = VirtualInterface::builder(0x1, test_mac(1))
            .registry(Arc::new(ShimRegistry::new()))
            .bridge(bridge);
        if let Some(engine) = engine {
            builder = builder.engine(engine);
        }
        builder.build().unwrap()
    }

    fn build_with_config(
        engine: Arc<ScriptedEngine>,
        bridge: Arc<RecordingBridge>,
        config: ShimConfig,
    ) -> Arc<VirtualInterface> {
        VirtualInterface::builder(0x1, test_mac(1))
            .registry(Arc::new(ShimRegistry::new()))
            .bridge(bridge)
            .engine(engine)
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let registry = Arc::new(ShimRegistry::new());
        let iface = VirtualInterface::builder(0xabcd, test_mac(7))
            .registry(registry.clone())
            .home_path("/var/lib/vnet")
            .metric(5000)
            .build()
            .unwrap();
        assert_eq!(iface.device_name(), "vnet0");
        assert_eq!(iface.mtu(), crate::config::DEFAULT_MTU);
        assert_eq!(iface.metric(), 5000);
        assert_eq!(iface.home_path(), Path::new("/var/lib/vnet"));
        assert!(iface.enabled());
        assert!(iface.is_running());

        iface.set_mtu(1400);
        assert_eq!(iface.mtu(), 1400);
        iface.set_friendly_name("office");
        iface.set_enabled(false);
        assert!(!iface.enabled());
    }

    #[test]
    fn test_add_ip_requires_engine() {
        let iface = build(None, Arc::default());
        assert!(!iface.add_ip("10.0.0.1/24".parse().unwrap()));
        assert!(iface.ips().is_empty());
    }

    #[test]
    fn test_add_ip_rejected_leaves_set_unchanged() {
        let engine = Arc::new(ScriptedEngine::new());
        let iface = build(Some(engine.clone()), Arc::default());
        assert!(iface.add_ip("10.0.0.1/24".parse().unwrap()));
        engine.set_accept_addresses(false);
        assert!(!iface.add_ip("10.0.0.2/24".parse().unwrap()));
        assert_eq!(iface.ips(), vec!["10.0.0.1/24".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn test_remove_ip_deregisters() {
        let engine = Arc::new(ScriptedEngine::new());
        let iface = build(Some(engine.clone()), Arc::default());
        let addr: IpNet = "fd00::1/64".parse().unwrap();
        assert!(iface.add_ip(addr));
        assert!(iface.remove_ip(addr));
        assert!(!iface.remove_ip(addr));
        assert!(engine.addresses().is_empty());
        assert!(iface.ips().is_empty());
    }

    #[test]
    fn test_listen_requires_bound() {
        let engine = Arc::new(ScriptedEngine::new());
        let iface = build(Some(engine), Arc::default());
        let id = iface.open(SocketType::Stream, None).unwrap();
        let err = iface.listen(id, 4).unwrap_err();
        assert!(matches!(err, ShimError::InvalidState { op: "listen", .. }));
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Unbound));
    }

    #[test]
    fn test_listening_close_skips_bridge() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(4))).unwrap();
        iface.bind(id, "0.0.0.0:80".parse().unwrap()).unwrap();
        iface.listen(id, 8).unwrap();

        iface.close(id).unwrap();
        assert_eq!(bridge.close_count(), 0);
        assert_eq!(engine.closed_count(), 1);
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Closing));
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(9))).unwrap();
        iface.close(id).unwrap();
        iface.close(id).unwrap();
        assert_eq!(bridge.closes(), vec![LocalSocket(9)]);
        assert_eq!(engine.closed_count(), 1);
    }

    #[test]
    fn test_local_close_does_not_call_back_into_bridge() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(2))).unwrap();
        iface.on_reactor_event(&ReactorEvent::LocalClose {
            sock: LocalSocket(2),
            conn: Some(id),
        });
        assert_eq!(bridge.close_count(), 0);
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Closing));
    }

    #[test]
    fn test_raw_write_splits_frame() {
        let (handler, frames) = frame_recorder();
        let iface = VirtualInterface::builder(0x1, test_mac(1))
            .registry(Arc::new(ShimRegistry::new()))
            .frame_handler(handler)
            .build()
            .unwrap();
        let id = iface.open(SocketType::Raw, None).unwrap();
        let src = EthernetAddress([2, 0, 0, 0, 0, 0xaa]);
        let dst = EthernetAddress([2, 0, 0, 0, 0, 0xbb]);
        let data = crate::engine::frame::build_ethernet_frame(dst, src, 0x88b5, &[7u8; 30]);

        assert_eq!(iface.write(id, &data).unwrap(), data.len());
        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].src, frames[0].dst), (src, dst));
        assert_eq!(frames[0].payload.len(), data.len() - ETHERNET_HDR_SIZE);
        assert_eq!(frames[0].vlan_id, 0);
    }

    #[test]
    fn test_raw_write_too_short() {
        let (handler, frames) = frame_recorder();
        let iface = VirtualInterface::builder(0x1, test_mac(1))
            .registry(Arc::new(ShimRegistry::new()))
            .frame_handler(handler)
            .build()
            .unwrap();
        let id = iface.open(SocketType::Raw, None).unwrap();
        let err = iface.write(id, &[0u8; 13]).unwrap_err();
        assert!(matches!(err, ShimError::MalformedFrame { len: 13 }));
        assert!(frames.lock().is_empty());
    }

    #[test]
    fn test_read_keeps_what_local_socket_refuses() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"hello world");
        bridge.set_write_limit(Some(5));
        assert_eq!(iface.read(id).unwrap(), 5);
        assert_eq!(bridge.written_to(LocalSocket(1)), b"hello");

        bridge.set_write_limit(None);
        iface.on_local_writable(LocalSocket(1), Some(id));
        assert_eq!(bridge.written_to(LocalSocket(1)), b"hello world");
    }

    #[test]
    fn test_stream_write_stages_until_writable() {
        let engine = Arc::new(ScriptedEngine::new());
        let iface = build(Some(engine.clone()), Arc::default());
        let id = iface.open(SocketType::Stream, None).unwrap();
        let sock = engine.last_socket().unwrap();
        iface.connect(id, "10.0.0.2:80".parse().unwrap()).unwrap();
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Connected));

        engine.set_write_limit(Some(3));
        assert_eq!(iface.write(id, b"abcdef").unwrap(), 6);
        assert_eq!(engine.outbound(sock), b"abc");

        engine.set_write_limit(None);
        iface.on_engine_event(sock, EngineEvent::Writable);
        assert_eq!(engine.outbound(sock), b"abcdef");
    }

    #[test]
    fn test_peer_close_marks_closing() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(3))).unwrap();
        let sock = engine.last_socket().unwrap();

        iface.on_engine_event(sock, EngineEvent::Closed);
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Closing));
        assert_eq!(bridge.closes(), vec![LocalSocket(3)]);
    }

    #[test]
    fn test_peer_close_delivers_staged_bytes_first() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"hello world");
        bridge.set_write_limit(Some(5));
        assert_eq!(iface.read(id).unwrap(), 5);

        iface.on_engine_event(sock, EngineEvent::Closed);
        assert_eq!(iface.connection_state(id), Some(ConnectionState::Closing));
        assert_eq!(bridge.close_count(), 0);

        bridge.set_write_limit(None);
        iface.on_local_writable(LocalSocket(1), Some(id));
        assert_eq!(bridge.written_to(LocalSocket(1)), b"hello world");
        assert_eq!(bridge.closes(), vec![LocalSocket(1)]);

        let err = iface.read(id).unwrap_err();
        assert!(matches!(err, ShimError::InvalidState { op: "read", .. }));
    }

    #[test]
    fn test_peer_close_pulls_unread_engine_data() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"last words");
        iface.on_engine_event(sock, EngineEvent::Closed);
        assert_eq!(bridge.written_to(LocalSocket(1)), b"last words");
        assert_eq!(bridge.closes(), vec![LocalSocket(1)]);
        assert!(engine.is_closed(sock));
    }

    #[test]
    fn test_attach_after_peer_close() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let listener = iface.open(SocketType::Stream, None).unwrap();
        let listen_sock = engine.last_socket().unwrap();
        iface.bind(listener, "0.0.0.0:80".parse().unwrap()).unwrap();
        iface.listen(listener, 4).unwrap();

        // Peer sent data and closed before the local socket was attached
        engine.queue_incoming(listen_sock, "10.0.0.2:4000".parse().unwrap());
        let with_data = iface.accept(listener).unwrap().unwrap();
        let sock = engine.last_socket().unwrap();
        engine.push_inbound(sock, b"bye");
        iface.on_engine_event(sock, EngineEvent::Closed);
        iface.attach_local(with_data, LocalSocket(7)).unwrap();
        assert_eq!(bridge.written_to(LocalSocket(7)), b"bye");
        assert_eq!(bridge.closes(), vec![LocalSocket(7)]);

        // Nothing staged: the local socket is closed at once
        engine.queue_incoming(listen_sock, "10.0.0.3:4000".parse().unwrap());
        let empty = iface.accept(listener).unwrap().unwrap();
        iface.on_engine_event(engine.last_socket().unwrap(), EngineEvent::Closed);
        iface.attach_local(empty, LocalSocket(8)).unwrap();
        assert!(bridge.written_to(LocalSocket(8)).is_empty());
        assert_eq!(bridge.closes(), vec![LocalSocket(7), LocalSocket(8)]);
    }

    #[test]
    fn test_close_discards_undelivered_after_peer_close() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"unread");
        bridge.set_write_limit(Some(0));
        iface.on_engine_event(sock, EngineEvent::Closed);
        assert_eq!(bridge.close_count(), 0);

        iface.close(id).unwrap();
        assert_eq!(bridge.closes(), vec![LocalSocket(1)]);
        bridge.set_write_limit(None);
        iface.on_local_writable(LocalSocket(1), Some(id));
        assert!(bridge.written_to(LocalSocket(1)).is_empty());
        assert_eq!(bridge.close_count(), 1);
    }

    #[test]
    fn test_local_data_beyond_tx_buffer_pauses_reads() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let config = ShimConfig::default().with_buffer_sizes(8, 8);
        let iface = build_with_config(engine.clone(), bridge.clone(), config);
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();
        iface.connect(id, "10.0.0.2:80".parse().unwrap()).unwrap();

        engine.set_write_limit(Some(0));
        iface.on_reactor_event(&ReactorEvent::LocalData {
            sock: LocalSocket(1),
            conn: Some(id),
            data: b"0123456789ABCDEF".to_vec(),
        });
        assert!(bridge.is_read_paused(LocalSocket(1)));
        assert!(engine.outbound(sock).is_empty());

        engine.set_write_limit(None);
        iface.on_engine_event(sock, EngineEvent::Writable);
        assert_eq!(engine.outbound(sock), b"0123456789ABCDEF");
        assert!(!bridge.is_read_paused(LocalSocket(1)));
        assert_eq!(bridge.pause_changes(), 2);
    }

    #[test]
    fn test_application_write_still_bounded_by_tx_buffer() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let config = ShimConfig::default().with_buffer_sizes(8, 8);
        let iface = build_with_config(engine.clone(), bridge.clone(), config);
        let id = iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();
        iface.connect(id, "10.0.0.2:80".parse().unwrap()).unwrap();

        engine.set_write_limit(Some(0));
        assert_eq!(iface.write(id, b"0123456789ABCDEF").unwrap(), 8);
        assert_eq!(bridge.pause_changes(), 0);
    }

    #[test]
    fn test_datagrams_keep_boundaries_when_local_socket_is_slow() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let config = ShimConfig::default().with_buffer_sizes(16, 64);
        let iface = build_with_config(engine.clone(), bridge.clone(), config);
        let id = iface.open(SocketType::Datagram, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"0123456789");
        engine.push_inbound(sock, b"abcdefghij");
        bridge.set_write_limit(Some(0));
        assert_eq!(iface.read(id).unwrap(), 0);

        bridge.set_write_limit(None);
        iface.on_local_writable(LocalSocket(1), Some(id));
        iface.on_local_writable(LocalSocket(1), Some(id));
        assert_eq!(
            bridge.writes(),
            vec![
                (LocalSocket(1), b"0123456789".to_vec()),
                (LocalSocket(1), b"abcdefghij".to_vec()),
            ]
        );
    }

    #[test]
    fn test_oversized_datagram_is_dropped() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let config = ShimConfig::default().with_buffer_sizes(8, 64);
        let iface = build_with_config(engine.clone(), bridge.clone(), config);
        let id = iface.open(SocketType::Datagram, Some(LocalSocket(1))).unwrap();
        let sock = engine.last_socket().unwrap();

        engine.push_inbound(sock, b"far too long for eight");
        engine.push_inbound(sock, b"short");
        assert_eq!(iface.read(id).unwrap(), 5);
        assert_eq!(bridge.writes(), vec![(LocalSocket(1), b"short".to_vec())]);
    }

    #[test]
    fn test_put_reaches_engine_unless_disabled() {
        let engine = Arc::new(ScriptedEngine::new());
        let iface = build(Some(engine.clone()), Arc::default());
        iface.put(test_mac(2), test_mac(1), 0x0806, &[1, 2, 3]);
        iface.set_enabled(false);
        iface.put(test_mac(2), test_mac(1), 0x0806, &[4, 5, 6]);

        let frames = engine.received_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].from, test_mac(2));
        assert_eq!(frames[0].ethertype, 0x0806);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_shutdown_order() {
        let engine = Arc::new(ScriptedEngine::new());
        let bridge = Arc::new(RecordingBridge::new());
        let iface = build(Some(engine.clone()), bridge.clone());
        iface.set_listen_socket(LocalSocket(100));
        iface.open(SocketType::Stream, Some(LocalSocket(1))).unwrap();

        iface.shutdown();
        assert!(!iface.is_running());
        assert!(engine.loop_exited());
        assert_eq!(bridge.closes(), vec![LocalSocket(100), LocalSocket(1)]);
        assert_eq!(bridge.wake_count(), 1);
        assert_eq!(iface.connection_count(), 0);

        iface.shutdown();
        assert_eq!(bridge.close_count(), 2);
    }
}
