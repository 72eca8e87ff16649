//! Ethernet framing for the virtual wire, using smoltcp's wire types.
//!
//! The virtual wire carries frames as header fields plus payload; the
//! engines and raw sockets deal in complete Ethernet frames. These helpers
//! convert between the two.

use std::fmt;
use std::sync::Arc;

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// A frame leaving an interface for the virtual wire.
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    /// Network the frame belongs to.
    pub nwid: u64,
    pub src: EthernetAddress,
    pub dst: EthernetAddress,
    pub ethertype: u16,
    /// 802.1Q tag, 0 when untagged.
    pub vlan_id: u32,
    /// Payload after the link-layer header.
    pub payload: &'a [u8],
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("nwid", &format_args!("{:016x}", self.nwid))
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("ethertype", &format_args!("{:#06x}", self.ethertype))
            .field("vlan_id", &self.vlan_id)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Callback that places frames on the virtual wire.
pub type FrameHandler = Arc<dyn Fn(&Frame<'_>) + Send + Sync>;

/// Frame handler that drops everything.
pub fn discard_frames() -> FrameHandler {
    Arc::new(|_frame: &Frame<'_>| {})
}

/// Parse an Ethernet frame
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

/// Split a complete Ethernet frame into wire fields for network `nwid`.
///
/// Returns `None` if `data` is shorter than an Ethernet header.
pub fn split_frame(nwid: u64, data: &[u8]) -> Option<Frame<'_>> {
    let frame = parse_ethernet(data)?;
    Some(Frame {
        nwid,
        src: frame.src_addr(),
        dst: frame.dst_addr(),
        ethertype: u16::from(frame.ethertype()),
        vlan_id: 0,
        payload: &data[ETHERNET_HDR_SIZE..],
    })
}

/// Build an Ethernet frame with the given payload
pub fn build_ethernet_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}
