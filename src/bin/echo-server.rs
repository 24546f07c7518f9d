use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rdma_echo::config::EchoConfig;
use rdma_echo::server::run_server;

/// RDMA echo server: accepts RC connections and echoes every message back.
#[derive(Parser, Debug)]
#[command(name = "echo-server", version, about)]
struct Args {
    /// Address to bind the RDMA listener to.
    ip: IpAddr,
    /// Port to listen on.
    port: u16,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = SocketAddr::new(args.ip, args.port);
    if let Err(e) = run_server(addr, &EchoConfig::default()) {
        tracing::error!(error = %e, "server failed");
        std::process::exit(e.errno().unwrap_or(1));
    }
}
