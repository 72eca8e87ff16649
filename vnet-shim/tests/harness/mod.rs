//! Test harness for interface integration tests
//!
//! Builds interfaces joined by an in-process virtual wire, each with its
//! own private registry so tests do not share device names.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use smoltcp::wire::EthernetAddress;

use vnet_shim::test_util::{LoopbackWire, RecordingBridge};
use vnet_shim::{ShimConfig, ShimRegistry, SmoltcpConfig, SmoltcpEngine, VirtualInterface};

/// Network id used by the harness
pub const NWID: u64 = 0x8056_c2e2_1c00_0001;

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// One interface with a smoltcp engine and a recording bridge.
pub struct TestNode {
    pub iface: Arc<VirtualInterface>,
    pub bridge: Arc<RecordingBridge>,
}

impl TestNode {
    pub fn new(wire: &Arc<LoopbackWire>, config: &ShimConfig, mac_suffix: u8, ip: &str) -> Self {
        let bridge = Arc::new(RecordingBridge::new());
        let iface = VirtualInterface::builder(NWID, EthernetAddress([0x02, 0, 0, 0, 0, mac_suffix]))
            .config(config.clone())
            .registry(Arc::new(ShimRegistry::new()))
            .engine(Arc::new(SmoltcpEngine::new(SmoltcpConfig::from_shim(config))))
            .bridge(bridge.clone())
            .frame_handler(wire.handler())
            .build()
            .expect("Failed to build interface");
        wire.attach(&iface);
        let ip: IpNet = ip.parse().expect("Invalid test address");
        assert!(iface.add_ip(ip), "engine rejected {ip}");
        Self { iface, bridge }
    }
}

/// Two nodes on one wire: `a` at 10.77.0.1, `b` at 10.77.0.2.
pub struct NodePair {
    pub wire: Arc<LoopbackWire>,
    pub a: TestNode,
    pub b: TestNode,
}

impl NodePair {
    pub fn new() -> Self {
        Self::with_config(ShimConfig::default())
    }

    pub fn with_config(config: ShimConfig) -> Self {
        let wire = LoopbackWire::new();
        let a = TestNode::new(&wire, &config, 1, "10.77.0.1/24");
        let b = TestNode::new(&wire, &config, 2, "10.77.0.2/24");
        Self { wire, a, b }
    }
}
