use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rdma_echo::client::run_client;
use rdma_echo::config::EchoConfig;

/// Interactive RDMA echo client: every stdin line is sent to the server and
/// its echo printed; the line "exit" disconnects.
#[derive(Parser, Debug)]
#[command(name = "echo-client", version, about)]
struct Args {
    /// Server IP address.
    ip: IpAddr,
    /// Server port.
    port: u16,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = SocketAddr::new(args.ip, args.port);
    if let Err(e) = run_client(addr, &EchoConfig::default()) {
        tracing::error!(error = %e, "client failed");
        std::process::exit(e.errno().unwrap_or(1));
    }
}
