//! Test utilities: a scripted stack engine, a recording reactor bridge
//! and an in-process virtual wire.
//!
//! Used by unit tests and by the integration tests under `tests/`.

pub mod bridge;
pub mod engine;
pub mod wire;

use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;

use crate::engine::frame::{Frame, FrameHandler};

pub use bridge::RecordingBridge;
pub use engine::{ReceivedFrame, ScriptedEngine};
pub use wire::LoopbackWire;

/// Locally administered unicast MAC ending in `n`.
pub fn test_mac(n: u8) -> EthernetAddress {
    EthernetAddress([0x02, 0, 0, 0, 0, n])
}

/// An owned copy of a frame sent to the virtual wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub nwid: u64,
    pub src: EthernetAddress,
    pub dst: EthernetAddress,
    pub ethertype: u16,
    pub vlan_id: u32,
    pub payload: Vec<u8>,
}

/// Frame handler that records every frame it is given.
pub fn frame_recorder() -> (FrameHandler, Arc<Mutex<Vec<RecordedFrame>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let handler: FrameHandler = Arc::new(move |f: &Frame<'_>| {
        sink.lock().push(RecordedFrame {
            nwid: f.nwid,
            src: f.src,
            dst: f.dst,
            ethertype: f.ethertype,
            vlan_id: f.vlan_id,
            payload: f.payload.to_vec(),
        });
    });
    (handler, frames)
}
