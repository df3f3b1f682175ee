//! TCP bridge: one circuit per connection.
//!
//! ```text
//!   socket ──read──► Transport::input ──► inbound drain ──► Application
//!                                                              │ reply
//!   socket ◄─write── writer task ◄── outbound drain ◄── Transport::send
//! ```
//!
//! Buffer operations block for bounded time, so they run under
//! `block_in_place`; the bridge requires a multi-thread runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nexdb_transport::{DataCallback, Direction, Transport, TransportError, TransportPool};

use crate::app::Application;

const SOCKET_READ_CHUNK: usize = 16 * 1024;

// ── Callbacks ────────────────────────────────────────────────────────────────

/// Outbound side: hands drained wire bytes to the socket writer task.
struct SocketWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    chunk: usize,
}

impl DataCallback for SocketWriter {
    fn buffer_for(&self, _circuit_id: u32, direction: Direction) -> usize {
        match direction {
            Direction::Outbound => self.chunk,
            Direction::Inbound => 0,
        }
    }

    fn on_ready(&self, circuit_id: u32, _direction: Direction, data: &[u8], _msg_id: u32) {
        if self.tx.send(Bytes::copy_from_slice(data)).is_err() {
            debug!(circuit_id, len = data.len(), "socket writer gone, bytes discarded");
        }
    }
}

/// Inbound side: delivers messages to the application and sends replies.
struct AppListener {
    app: Arc<dyn Application>,
    transport: Weak<Transport>,
    max_message: usize,
}

impl DataCallback for AppListener {
    fn buffer_for(&self, _circuit_id: u32, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.max_message,
            Direction::Outbound => 0,
        }
    }

    fn on_ready(&self, circuit_id: u32, _direction: Direction, data: &[u8], msg_id: u32) {
        let Some(reply) = self.app.on_message(circuit_id, msg_id, data) else {
            return;
        };
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        if let Err(e) = transport.send(&reply, msg_id, transport.config().io_timeout()) {
            warn!(circuit_id, msg_id, error = %e, "reply not sent");
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// A socket attached to a circuit. The circuit is closed when the peer
/// disconnects.
pub struct Connection {
    circuit_id: u32,
    peer: SocketAddr,
    transport: Arc<Transport>,
    pool: Arc<TransportPool>,
    task: JoinHandle<()>,
}

impl Connection {
    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Send one message to the peer.
    pub async fn send(&self, data: &[u8], msg_id: u32) -> Result<usize, TransportError> {
        let timeout = self.transport.config().io_timeout();
        tokio::task::block_in_place(|| self.transport.send(data, msg_id, timeout))
    }

    /// Wait until the connection has shut down.
    pub async fn closed(self) {
        let _ = self.task.await;
    }

    /// Drop the socket and close the circuit.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
        self.pool.close_circuit(self.circuit_id);
    }
}

/// Open `circuit_id` on `pool` and wire `stream` to it.
pub fn attach(
    stream: TcpStream,
    pool: Arc<TransportPool>,
    circuit_id: u32,
    app: Arc<dyn Application>,
) -> Result<Connection> {
    let peer = stream.peer_addr().context("connection has no peer address")?;
    stream.set_nodelay(true)?;
    let transport = pool
        .open_circuit(circuit_id)
        .with_context(|| format!("failed to open circuit {circuit_id}"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = Arc::new(SocketWriter {
        tx,
        chunk: transport.config().segment_size.max(SOCKET_READ_CHUNK),
    });
    let listener = Arc::new(AppListener {
        app,
        transport: Arc::downgrade(&transport),
        max_message: transport.config().max_message_size,
    });
    transport.add_callback(Arc::downgrade(&writer) as Weak<dyn DataCallback>);
    transport.add_callback(Arc::downgrade(&listener) as Weak<dyn DataCallback>);

    let (read_half, write_half) = stream.into_split();
    let task = {
        let transport = transport.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let writer_task = tokio::spawn(write_loop(write_half, rx, circuit_id));
            match read_loop(read_half, &transport).await {
                Ok(()) => info!(circuit_id, %peer, "peer closed connection"),
                Err(e) => warn!(circuit_id, %peer, error = %e, "connection failed"),
            }
            pool.close_circuit(circuit_id);
            // Dropping the callbacks closes the writer channel once queued
            // bytes are flushed.
            drop(listener);
            drop(writer);
            let _ = writer_task.await;
        })
    };

    info!(circuit_id, %peer, "connection attached");
    Ok(Connection {
        circuit_id,
        peer,
        transport,
        pool,
        task,
    })
}

async fn read_loop(mut reader: OwnedReadHalf, transport: &Arc<Transport>) -> Result<()> {
    let timeout = transport.config().io_timeout();
    let mut buf = vec![0u8; SOCKET_READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        feed(transport, &buf[..n], timeout)?;
    }
}

/// Push socket bytes into the circuit, holding the socket back while the
/// inbound buffer is full.
///
/// Writes are all-or-nothing, so `data` goes in pieces no larger than the
/// space currently free. This task is the only writer and drain passes
/// only free space, so a piece sized that way never waits.
fn feed(transport: &Transport, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
    let capacity = transport.config().inbound_capacity;
    tokio::task::block_in_place(|| {
        let mut rest = data;
        while !rest.is_empty() {
            let free = capacity.saturating_sub(transport.inbound_used());
            let piece = rest.len().min(free.max(1));
            match transport.input(&rest[..piece], timeout) {
                Ok(n) => rest = &rest[n..],
                Err(TransportError::BufferFull) => {
                    debug!(
                        circuit_id = transport.circuit_id(),
                        "inbound buffer full, holding socket"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    circuit_id: u32,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            warn!(circuit_id, error = %e, "socket write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Accept connections forever, one circuit each.
pub async fn serve(
    listener: TcpListener,
    pool: Arc<TransportPool>,
    app: Arc<dyn Application>,
) -> Result<()> {
    let next_id = AtomicU32::new(1);
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let circuit_id = free_circuit_id(&pool, &next_id);
        match attach(stream, pool.clone(), circuit_id, app.clone()) {
            // The connection task owns the circuit from here on.
            Ok(_connection) => {}
            Err(e) => warn!(%peer, error = %e, "failed to attach connection"),
        }
    }
}

/// Dial `addr` and attach the socket as `circuit_id`.
pub async fn connect(
    addr: impl ToSocketAddrs,
    pool: Arc<TransportPool>,
    circuit_id: u32,
    app: Arc<dyn Application>,
) -> Result<Connection> {
    let stream = TcpStream::connect(addr).await.context("connect failed")?;
    attach(stream, pool, circuit_id, app)
}

fn free_circuit_id(pool: &TransportPool, next_id: &AtomicU32) -> u32 {
    loop {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        if id != 0 && pool.get_circuit(id).is_none() {
            return id;
        }
    }
}
