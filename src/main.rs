use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use byte::BytesExt;
use clap::Parser;
use mac_address::MacAddress;
use tracing::{info, warn};

use netgate::wire::ethernet::EthernetHeader;
use netgate::{GatewayConfig, GatewayError, Ipv4Prefix, NetworkContext, OwnerToken};

const MONITOR: OwnerToken = OwnerToken(0);

/// Joins a simulated network as a passive controller and logs every frame
/// that reaches it.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Simulated network, as `a.b.c.d/len`.
    #[arg(long, default_value = netgate::config::DEFAULT_NETWORK)]
    network: Ipv4Prefix,

    /// Remote emulator instance to relay frames with, as `host:port`. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Local UDP port for frames relayed by remote instances.
    #[arg(long)]
    relay_port: Option<u16>,

    /// Host resolver configuration.
    #[arg(long, default_value = netgate::resolver::DEFAULT_RESOLV_CONF)]
    resolv_conf: PathBuf,

    /// Milliseconds between poll rounds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// MAC address of the monitor's controller.
    #[arg(long, default_value = "52:54:00:12:34:56")]
    mac: MacAddress,
}

fn main() -> Result<(), GatewayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::new(args.network);
    config.peers = args.peers;
    config.relay_port = args.relay_port;
    config.resolv_conf = args.resolv_conf;

    let mut network = NetworkContext::new(config)?;
    network.register_nic(MONITOR, args.mac);
    info!(
        gateway = %network.gateway_ip(),
        relay_port = ?network.relay_port(),
        "monitoring"
    );

    let tick = Duration::from_millis(args.tick_ms);
    loop {
        while let Some(frame) = network.poll_and_receive(MONITOR) {
            match frame.read::<EthernetHeader>(&mut 0) {
                Ok(header) => info!(len = frame.len(), "{header}"),
                Err(err) => warn!(len = frame.len(), ?err, "undecodable frame"),
            }
        }
        thread::sleep(tick);
    }
}
