//! In-process virtual wire connecting interfaces of the same network.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::engine::frame::{Frame, FrameHandler};
use crate::iface::VirtualInterface;

/// Broadcast segment: every frame goes to each other attached interface
/// on the same network.
///
/// Interfaces are held weakly so dropping one tears it down normally.
#[derive(Default)]
pub struct LoopbackWire {
    ports: Mutex<Vec<Weak<VirtualInterface>>>,
    delivered: Mutex<usize>,
}

impl LoopbackWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frame handler for an interface attached to this wire.
    pub fn handler(self: &Arc<Self>) -> FrameHandler {
        let wire = Arc::downgrade(self);
        Arc::new(move |frame: &Frame<'_>| {
            if let Some(wire) = wire.upgrade() {
                wire.carry(frame);
            }
        })
    }

    pub fn attach(&self, iface: &Arc<VirtualInterface>) {
        self.ports.lock().push(Arc::downgrade(iface));
    }

    /// Frames handed to an interface so far.
    pub fn frames_delivered(&self) -> usize {
        *self.delivered.lock()
    }

    fn carry(&self, frame: &Frame<'_>) {
        let targets: Vec<Arc<VirtualInterface>> = {
            let mut ports = self.ports.lock();
            ports.retain(|p| p.strong_count() > 0);
            ports
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|iface| iface.nwid() == frame.nwid && iface.mac() != frame.src)
                .collect()
        };
        for iface in targets {
            trace!(from = %frame.src, to = %iface.device_name(), len = frame.payload.len(), "Wire delivery");
            iface.put(frame.src, frame.dst, frame.ethertype, frame.payload);
            *self.delivered.lock() += 1;
        }
    }
}
