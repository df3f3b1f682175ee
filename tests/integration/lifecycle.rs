use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_each_connection_gets_its_own_circuit() -> Result<()> {
    let server = start_echo_server().await?;
    let (first, mut first_rx) = connect_client(&server, 1).await?;
    let (second, mut second_rx) = connect_client(&server, 1).await?;

    assert!(eventually(|| server.pool.len() == 2).await);
    let ids = server.pool.list_circuit_ids();
    assert_ne!(ids[0], ids[1]);

    first.send(b"from first", 1).await?;
    second.send(b"from second", 1).await?;
    assert_eq!(recv_reply(&mut first_rx).await?.1, b"from first");
    assert_eq!(recv_reply(&mut second_rx).await?.1, b"from second");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_closes_server_circuit() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, mut rx) = connect_client(&server, 1).await?;
    conn.send(b"ping", 1).await?;
    recv_reply(&mut rx).await?;
    assert_eq!(server.pool.len(), 1);

    let server_circuit = server
        .pool
        .get_circuit(server.pool.list_circuit_ids()[0])
        .context("server circuit should exist")?;
    conn.close().await;

    assert!(eventually(|| server.pool.is_empty()).await);
    assert!(server_circuit.is_stopped());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_pool_rejects_duplicate_circuit() -> Result<()> {
    let server = start_echo_server().await?;
    let pool = new_pool();
    let (inbox, _rx) = Inbox::new();
    let _conn = bridge::connect(server.addr, pool.clone(), 9, inbox.clone()).await?;

    let err = bridge::connect(server.addr, pool.clone(), 9, inbox)
        .await
        .err()
        .context("second connect with the same circuit id should fail")?;
    assert!(err.to_string().contains("circuit 9"), "unexpected error: {err:#}");
    assert_eq!(pool.list_circuit_ids(), vec![9]);
    Ok(())
}
