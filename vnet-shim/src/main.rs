use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, unbounded};
use ipnet::IpNet;
use smoltcp::wire::EthernetAddress;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vnet_shim::test_util::LoopbackWire;
use vnet_shim::{
    ConnectionId, ConnectionState, LocalSocket, ReactorBridge, ShimConfig, ShimRegistry,
    SmoltcpConfig, SmoltcpEngine, SocketType, VirtualInterface,
};

/// Run two virtual interfaces on an in-process wire and echo a message
/// over TCP between them.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Shim configuration (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network id, hexadecimal
    #[arg(long, default_value = "8056c2e21c000001", value_parser = parse_nwid)]
    nwid: u64,

    /// Server address (with prefix length)
    #[arg(long, default_value = "10.147.17.1/24")]
    server_ip: IpNet,

    /// Client address (with prefix length)
    #[arg(long, default_value = "10.147.17.2/24")]
    client_ip: IpNet,

    /// TCP port the server listens on
    #[arg(short, long, default_value_t = 7)]
    port: u16,

    /// Message the client sends
    #[arg(short, long, default_value = "hello over the virtual wire")]
    message: String,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn parse_nwid(s: &str) -> Result<u64, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("invalid network id: {e}"))
}

/// Reactor bridge that forwards local socket writes to a channel.
struct ChannelBridge {
    tx: Sender<(LocalSocket, Vec<u8>)>,
}

impl ReactorBridge for ChannelBridge {
    fn write_local(&self, sock: LocalSocket, data: &[u8]) -> io::Result<usize> {
        self.tx
            .send((sock, data.to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(data.len())
    }

    fn close_local(&self, sock: LocalSocket) {
        info!(%sock, "Local socket closed");
    }
}

struct Node {
    iface: Arc<VirtualInterface>,
    inbound: Receiver<(LocalSocket, Vec<u8>)>,
}

fn node(
    wire: &Arc<LoopbackWire>,
    config: &ShimConfig,
    nwid: u64,
    mac: EthernetAddress,
    ip: IpNet,
) -> anyhow::Result<Node> {
    let (tx, inbound) = unbounded();
    let iface = VirtualInterface::builder(nwid, mac)
        .config(config.clone())
        .registry(Arc::new(ShimRegistry::new()))
        .engine(Arc::new(SmoltcpEngine::new(SmoltcpConfig::from_shim(config))))
        .bridge(Arc::new(ChannelBridge { tx }))
        .frame_handler(wire.handler())
        .build()?;
    wire.attach(&iface);
    if !iface.add_ip(ip) {
        bail!("engine rejected {ip} on {}", iface.device_name());
    }
    let delta = iface.scan_multicast_groups();
    info!(device = %iface.device_name(), %ip, groups = delta.added.len(), "Node ready");
    Ok(Node { iface, inbound })
}

/// Poll `f` until it yields a value or `deadline` passes.
fn poll_until<T>(
    deadline: Instant,
    what: &str,
    mut f: impl FnMut() -> anyhow::Result<Option<T>>,
) -> anyhow::Result<T> {
    loop {
        if let Some(v) = f()? {
            return Ok(v);
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn receive(node: &Node, deadline: Instant, want: usize) -> anyhow::Result<Vec<u8>> {
    let mut received = Vec::new();
    while received.len() < want {
        let left = deadline.saturating_duration_since(Instant::now());
        let (_, chunk) = node.inbound.recv_timeout(left).context("no data from peer")?;
        received.extend_from_slice(&chunk);
    }
    Ok(received)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ShimConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ShimConfig::default(),
    };
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    let wire = LoopbackWire::new();
    let server = node(&wire, &config, args.nwid, EthernetAddress([0x02, 0, 0, 0, 0, 1]), args.server_ip)?;
    let client = node(&wire, &config, args.nwid, EthernetAddress([0x02, 0, 0, 0, 0, 2]), args.client_ip)?;

    let listener = server.iface.open(SocketType::Stream, None)?;
    let bind_addr = SocketAddr::new(args.server_ip.addr(), args.port);
    server.iface.bind(listener, bind_addr)?;
    server.iface.listen(listener, 4)?;

    let client_sock = LocalSocket(1);
    let outbound = client.iface.open(SocketType::Stream, Some(client_sock))?;
    client.iface.connect(outbound, bind_addr)?;

    let accepted: ConnectionId = poll_until(deadline, "accept", || Ok(server.iface.accept(listener)?))?;
    server.iface.attach_local(accepted, LocalSocket(2))?;
    poll_until(deadline, "connect", || {
        Ok((client.iface.connection_state(outbound) == Some(ConnectionState::Connected)).then_some(()))
    })?;
    info!(%listener, %accepted, %outbound, "Connection established");

    let message = args.message.as_bytes();
    client.iface.write(outbound, message)?;
    let request = receive(&server, deadline, message.len())?;
    server.iface.write(accepted, &request)?;
    let reply = receive(&client, deadline, message.len())?;
    if reply != message {
        bail!("echo mismatch: {:?}", String::from_utf8_lossy(&reply));
    }
    println!("{}", String::from_utf8_lossy(&reply));

    client.iface.close(outbound)?;
    server.iface.close(accepted)?;
    server.iface.close(listener)?;
    info!(
        frames = wire.frames_delivered(),
        released = server.iface.housekeeping() + client.iface.housekeeping(),
        "Echo complete"
    );
    client.iface.shutdown();
    server.iface.shutdown();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Args::parse()) {
        warn!(error = %e, "Echo failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
