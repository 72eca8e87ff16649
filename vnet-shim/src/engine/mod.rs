//! Stack engine contract.
//!
//! A stack engine is a userspace TCP/IP implementation driven by one
//! [`VirtualInterface`](crate::iface::VirtualInterface). Engines are
//! injected at runtime as `Arc<dyn StackEngine>`, so different interfaces
//! in one process may run different engines.
//!
//! The interface owns a dedicated thread that calls [`StackEngine::run`].
//! That loop is the only place where engine timers and protocol state
//! advance. It reports socket readiness back to the interface through
//! [`LoopContext::notify`] and must only block through
//! [`LoopContext::wait`], so teardown can always wake it.
//!
//! Lock order: the interface may call into the engine while holding its
//! connection table lock. An engine must therefore never call
//! [`LoopContext::notify`] or [`LoopContext::tick`] while holding its own
//! internal lock.

pub mod frame;
pub mod smoltcp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ipnet::IpNet;
use ::smoltcp::wire::EthernetAddress;
use tracing::trace;

use crate::connection::SocketType;
use crate::error::EngineResult;
use frame::{Frame, FrameHandler, split_frame};

pub use self::smoltcp::{SmoltcpConfig, SmoltcpEngine};

/// Opaque engine-side socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineSocket(pub u64);

impl fmt::Display for EngineSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "esock#{}", self.0)
    }
}

/// Readiness events an engine reports for one of its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Inbound data is waiting in the engine.
    Readable,
    /// The engine can take more outbound data.
    Writable,
    /// An outbound connect completed.
    Connected,
    /// A listening socket has a peer waiting in `accept`.
    Incoming,
    /// The peer closed the connection or it was reset.
    Closed,
}

/// What an engine needs to know about the interface it serves.
pub struct InterfaceInfo {
    nwid: u64,
    device_name: String,
    mac: EthernetAddress,
    mtu: AtomicU32,
    frame_handler: FrameHandler,
}

impl InterfaceInfo {
    pub fn new(
        nwid: u64,
        device_name: impl Into<String>,
        mac: EthernetAddress,
        mtu: u32,
        frame_handler: FrameHandler,
    ) -> Self {
        Self {
            nwid,
            device_name: device_name.into(),
            mac,
            mtu: AtomicU32::new(mtu),
            frame_handler,
        }
    }

    pub fn nwid(&self) -> u64 {
        self.nwid
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    /// Place a frame on the virtual wire.
    pub fn send(&self, frame: &Frame<'_>) {
        (self.frame_handler)(frame);
    }

    /// Split a complete Ethernet frame and place it on the virtual wire.
    ///
    /// Returns false, without calling the frame handler, if `data` is
    /// shorter than an Ethernet header.
    pub fn send_ethernet(&self, data: &[u8]) -> bool {
        match split_frame(self.nwid, data) {
            Some(frame) => {
                trace!(device = %self.device_name, len = data.len(), "Frame to wire");
                self.send(&frame);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceInfo")
            .field("nwid", &format_args!("{:016x}", self.nwid))
            .field("device_name", &self.device_name)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu())
            .finish()
    }
}

/// Receiver of engine loop callbacks, implemented by the interface.
pub trait EventSink: Send + Sync {
    /// An engine socket changed readiness.
    fn on_engine_event(&self, sock: EngineSocket, event: EngineEvent);

    /// Periodic work driven from the loop (connection housekeeping).
    fn on_tick(&self);
}

/// Handle given to [`StackEngine::run`] for the lifetime of the loop.
pub struct LoopContext<'a> {
    iface: &'a InterfaceInfo,
    running: &'a AtomicBool,
    wake_rx: &'a Receiver<()>,
    sink: &'a dyn EventSink,
    max_wait: Duration,
}

impl<'a> LoopContext<'a> {
    pub fn new(
        iface: &'a InterfaceInfo,
        running: &'a AtomicBool,
        wake_rx: &'a Receiver<()>,
        sink: &'a dyn EventSink,
        max_wait: Duration,
    ) -> Self {
        Self {
            iface,
            running,
            wake_rx,
            sink,
            max_wait,
        }
    }

    pub fn interface(&self) -> &InterfaceInfo {
        self.iface
    }

    /// False once the interface has been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Block until woken or until `timeout` (capped at the configured
    /// maximum poll interval) passes. Returns true if woken.
    ///
    /// All pending wake-ups are consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let timeout = timeout.min(self.max_wait);
        let woken = match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // All wakers gone: the interface is being torn down.
            Err(RecvTimeoutError::Disconnected) => true,
        };
        while self.wake_rx.try_recv().is_ok() {}
        woken
    }

    /// Report a socket event to the interface.
    pub fn notify(&self, sock: EngineSocket, event: EngineEvent) {
        self.sink.on_engine_event(sock, event);
    }

    /// Give the interface a chance to run periodic work.
    pub fn tick(&self) {
        self.sink.on_tick();
    }
}

/// A pluggable TCP/IP engine.
///
/// Socket calls may be made from any thread, concurrently with `run`.
pub trait StackEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &'static str;

    /// Register `addr` on the interface. Returns false if the engine
    /// refuses it.
    fn init_interface(&self, iface: &InterfaceInfo, addr: IpNet) -> bool;

    /// De-register `addr`. Returns false if it was not registered.
    fn remove_address(&self, iface: &InterfaceInfo, addr: IpNet) -> bool;

    /// Accept one frame from the virtual wire.
    fn rx(
        &self,
        iface: &InterfaceInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ethertype: u16,
        data: &[u8],
    );

    /// Run the engine loop until `ctx.is_running()` turns false.
    fn run(&self, ctx: &LoopContext<'_>);

    /// Create a socket.
    fn open(&self, socket_type: SocketType) -> EngineResult<EngineSocket>;

    /// Start a connection to `remote`. Returns true if already connected,
    /// false if completion will be reported by [`EngineEvent::Connected`].
    fn connect(&self, sock: EngineSocket, remote: SocketAddr) -> EngineResult<bool>;

    fn bind(&self, sock: EngineSocket, local: SocketAddr) -> EngineResult<()>;

    fn listen(&self, sock: EngineSocket, backlog: usize) -> EngineResult<()>;

    /// Take one pending peer from a listening socket.
    fn accept(&self, sock: EngineSocket) -> EngineResult<Option<(EngineSocket, SocketAddr)>>;

    /// Size of the next queued datagram on a datagram socket, or `None`
    /// when nothing is queued or the socket is not a datagram socket.
    fn pending_datagram(&self, sock: EngineSocket) -> EngineResult<Option<usize>>;

    /// Copy pending inbound bytes into `buf`. On a datagram socket one call
    /// returns at most one datagram.
    fn read(&self, sock: EngineSocket, buf: &mut [u8]) -> EngineResult<usize>;

    /// Queue outbound bytes. Returns how many were accepted.
    fn write(&self, sock: EngineSocket, data: &[u8]) -> EngineResult<usize>;

    fn close(&self, sock: EngineSocket) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Default)]
    struct Sink {
        events: Mutex<Vec<(EngineSocket, EngineEvent)>>,
        ticks: Mutex<usize>,
    }

    impl EventSink for Sink {
        fn on_engine_event(&self, sock: EngineSocket, event: EngineEvent) {
            self.events.lock().push((sock, event));
        }

        fn on_tick(&self) {
            *self.ticks.lock() += 1;
        }
    }

    fn info(frames: Arc<Mutex<Vec<u16>>>) -> InterfaceInfo {
        let handler: FrameHandler = Arc::new(move |f: &Frame<'_>| frames.lock().push(f.ethertype));
        InterfaceInfo::new(0x1, "vnet0", EthernetAddress([2, 0, 0, 0, 0, 1]), 2800, handler)
    }

    #[test]
    fn test_wait_is_capped_and_woken() {
        let iface = info(Arc::default());
        let running = AtomicBool::new(true);
        let (tx, rx) = bounded(1);
        let sink = Sink::default();
        let ctx = LoopContext::new(&iface, &running, &rx, &sink, Duration::from_millis(10));

        let start = Instant::now();
        assert!(!ctx.wait(Duration::from_secs(60)));
        assert!(start.elapsed() < Duration::from_secs(5));

        tx.try_send(()).unwrap();
        assert!(ctx.wait(Duration::from_secs(60)));

        running.store(false, Ordering::Release);
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_notify_and_tick_reach_sink() {
        let iface = info(Arc::default());
        let running = AtomicBool::new(true);
        let (_tx, rx) = bounded(1);
        let sink = Sink::default();
        let ctx = LoopContext::new(&iface, &running, &rx, &sink, Duration::from_millis(10));

        ctx.notify(EngineSocket(3), EngineEvent::Readable);
        ctx.tick();
        assert_eq!(*sink.events.lock(), vec![(EngineSocket(3), EngineEvent::Readable)]);
        assert_eq!(*sink.ticks.lock(), 1);
    }

    #[test]
    fn test_send_ethernet_rejects_short_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let iface = info(frames.clone());
        assert!(!iface.send_ethernet(&[0u8; 10]));

        let mut data = vec![0u8; 20];
        data[12..14].copy_from_slice(&[0x86, 0xdd]);
        assert!(iface.send_ethernet(&data));
        assert_eq!(*frames.lock(), vec![0x86dd]);

        iface.set_mtu(1500);
        assert_eq!(iface.mtu(), 1500);
    }
}
