use crate::*;

use nexdb_core::crypto::SessionKey;
use nexdb_transport::Transport;

/// Configures every server-side circuit as it opens.
struct ServerSetup {
    rx: SessionKey,
    tx: SessionKey,
    compress: bool,
}

impl CircuitObserver for ServerSetup {
    fn on_open(&self, _circuit_id: u32, transport: &Arc<Transport>) {
        transport.set_session_keys(self.rx.clone(), self.tx.clone(), false);
        transport.set_compression(self.compress);
    }

    fn on_close(&self, _circuit_id: u32) {}
}

async fn keyed_echo(compress: bool) -> Result<(Server, Connection, mpsc::UnboundedReceiver<(u32, Vec<u8>)>)> {
    let secret = b"integration test shared secret";
    let up = SessionKey::derive("nexdb integration client->server", secret);
    let down = SessionKey::derive("nexdb integration server->client", secret);

    let setup = Arc::new(ServerSetup {
        rx: up.clone(),
        tx: down.clone(),
        compress,
    });
    let server = start_server(Arc::new(Echo), Some(setup)).await?;
    let (conn, rx) = connect_client(&server, 1).await?;
    conn.transport().set_session_keys(down, up, false);
    conn.transport().set_compression(compress);
    Ok((server, conn, rx))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_echo() -> Result<()> {
    let (_server, conn, mut rx) = keyed_echo(false).await?;
    let body = pattern(40 * 1024);
    conn.send(&body, 5).await?;
    assert_eq!(recv_reply(&mut rx).await?, (5, body));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_compressed_echo() -> Result<()> {
    let (_server, conn, mut rx) = keyed_echo(true).await?;
    let body = b"SELECT * FROM nexdb WHERE id = 42;\n".repeat(4000);
    conn.send(&body, 6).await?;
    assert_eq!(recv_reply(&mut rx).await?, (6, body));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_key_rotation_mid_stream() -> Result<()> {
    let (server, conn, mut rx) = keyed_echo(false).await?;
    conn.send(b"under first keys", 1).await?;
    assert_eq!(recv_reply(&mut rx).await?.1, b"under first keys");

    let up = SessionKey::generate();
    let down = SessionKey::generate();
    let server_circuit = server
        .pool
        .get_circuit(server.pool.list_circuit_ids()[0])
        .context("server circuit should exist")?;
    // Both sides stage the peer's new key and switch their own.
    server_circuit.set_session_keys(up.clone(), down.clone(), true);
    conn.transport().set_session_keys(down, up, true);

    for msg_id in 2..=5u32 {
        let body = format!("under rotated keys #{msg_id}");
        conn.send(body.as_bytes(), msg_id).await?;
        assert_eq!(recv_reply(&mut rx).await?, (msg_id, body.into_bytes()));
    }
    Ok(())
}
