//! End-to-end echo over a real RDMA device.
//!
//! These tests need an RDMA-capable device; SoftRoCE (`rdma_rxe`) on an
//! ordinary interface is enough. When no device is present, or the CM
//! cannot bind or connect in this environment, the tests skip with a
//! message instead of failing.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use rdma_echo::client::EchoClient;
use rdma_echo::config::EchoConfig;
use rdma_echo::context::rdma_device_present;
use rdma_echo::server::EchoServer;

/// Bind a server and connect a client, or explain why this environment
/// cannot run the exchange.
fn connect_pair(port: u16, config: &EchoConfig) -> Option<(SocketAddr, EchoClient)> {
    if !rdma_device_present() {
        eprintln!("skipping: no RDMA device present");
        return None;
    }
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let mut server = match EchoServer::bind(addr, config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("skipping: cannot bind an RDMA CM listener: {e}");
            return None;
        }
    };
    thread::spawn(move || {
        let _ = server.serve();
    });

    match EchoClient::connect(addr, config) {
        Ok(client) => Some((addr, client)),
        Err(e) => {
            eprintln!("skipping: cannot connect over RDMA CM: {e}");
            None
        }
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn echo_round_trip_and_sentinel_shutdown() -> anyhow::Result<()> {
    let config = EchoConfig::default();
    let Some((_addr, client)) = connect_pair(18515, &config) else {
        return Ok(());
    };
    let conn = client.connection().clone();

    client.send_line("hello rdma")?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(5), || conn.completed_receives() >= 1),
        "no echo arrived within the deadline"
    );
    assert_eq!(conn.recv_payload(), "hello rdma");

    client.send_line("second message")?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(5), || conn.completed_receives() >= 2),
        "the server stopped echoing after one exchange"
    );
    assert_eq!(conn.recv_payload(), "second message");

    // one initial receive plus one per exchange
    assert!(conn.posted_receives() >= conn.completed_receives() + 1);

    // sentinel shutdown: nothing further is posted after the disconnect
    let sends_before = conn.posted_sends();
    client.disconnect()?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(5), || client.is_closed()),
        "disconnect did not complete"
    );
    assert_eq!(conn.posted_sends(), sends_before);
    Ok(())
}

#[test]
fn posting_beyond_receive_capacity_fails() -> anyhow::Result<()> {
    let config = EchoConfig::default();
    let Some((_addr, client)) = connect_pair(18516, &config) else {
        return Ok(());
    };
    let conn = client.connection().clone();

    // the initial receive is already outstanding; filling the rest of the
    // queue must eventually be refused
    let mut refused = false;
    for _ in 0..config.queue_depth + 2 {
        if conn.post_receive().is_err() {
            refused = true;
            break;
        }
    }
    assert!(refused, "posting beyond the receive queue depth must fail");

    let _ = client.disconnect();
    wait_until(Duration::from_secs(5), || client.is_closed());
    Ok(())
}
