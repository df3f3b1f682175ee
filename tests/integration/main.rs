//! nexdb integration test harness.
//!
//! Every test runs a real daemon bridge on a loopback TCP port and talks to
//! it through a second, client-side pool:
//!
//!   cargo test --test integration
//!
//! The bridge blocks inside `block_in_place`, so tests need the
//! multi-thread runtime flavor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nexdb_core::config::{PoolConfig, TransportConfig};
use nexdb_transport::{CircuitObserver, TransportPool};
use nexdbd::{bridge, Application, Connection, Echo};

mod echo;
mod lifecycle;
mod security;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config() -> TransportConfig {
    TransportConfig {
        segment_size: 16 * 1024,
        outbound_capacity: 256 * 1024,
        inbound_capacity: 256 * 1024,
        max_message_size: 1024 * 1024,
        ..TransportConfig::default()
    }
}

pub fn new_pool() -> Arc<TransportPool> {
    new_pool_with(test_config())
}

pub fn new_pool_with(config: TransportConfig) -> Arc<TransportPool> {
    let pool = PoolConfig {
        worker_threads: 2,
        inbound_share_percent: 50,
    };
    Arc::new(TransportPool::new(config, &pool).expect("pool should start"))
}

/// A bridge serving on an ephemeral loopback port.
pub struct Server {
    pub addr: SocketAddr,
    pub pool: Arc<TransportPool>,
    task: JoinHandle<Result<()>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_server(
    app: Arc<dyn Application>,
    observer: Option<Arc<dyn CircuitObserver>>,
) -> Result<Server> {
    start_server_with(test_config(), app, observer).await
}

pub async fn start_server_with(
    config: TransportConfig,
    app: Arc<dyn Application>,
    observer: Option<Arc<dyn CircuitObserver>>,
) -> Result<Server> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let pool = new_pool_with(config);
    if let Some(observer) = observer {
        pool.add_observer(observer);
    }
    let task = tokio::spawn(bridge::serve(listener, pool.clone(), app));
    Ok(Server { addr, pool, task })
}

pub async fn start_echo_server() -> Result<Server> {
    start_server(Arc::new(Echo), None).await
}

/// Collects everything delivered on the client side.
pub struct Inbox {
    tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
}

impl Inbox {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(u32, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Application for Inbox {
    fn on_message(&self, _circuit_id: u32, msg_id: u32, payload: &[u8]) -> Option<Vec<u8>> {
        let _ = self.tx.send((msg_id, payload.to_vec()));
        None
    }
}

/// Dial `server` as circuit `circuit_id`; replies land on the returned
/// receiver.
pub async fn connect_client(
    server: &Server,
    circuit_id: u32,
) -> Result<(Connection, mpsc::UnboundedReceiver<(u32, Vec<u8>)>)> {
    connect_client_with(server, circuit_id, test_config()).await
}

pub async fn connect_client_with(
    server: &Server,
    circuit_id: u32,
    config: TransportConfig,
) -> Result<(Connection, mpsc::UnboundedReceiver<(u32, Vec<u8>)>)> {
    let (inbox, rx) = Inbox::new();
    let conn = bridge::connect(server.addr, new_pool_with(config), circuit_id, inbox).await?;
    Ok((conn, rx))
}

pub async fn recv_reply(rx: &mut mpsc::UnboundedReceiver<(u32, Vec<u8>)>) -> Result<(u32, Vec<u8>)> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .context("timed out waiting for a reply")?
        .context("inbox closed")
}

/// Poll `check` until it holds or `WAIT` passes.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
