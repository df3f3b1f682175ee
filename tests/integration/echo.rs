use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_small_message() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, mut rx) = connect_client(&server, 1).await?;

    conn.send(b"hello nexdb", 7).await?;
    assert_eq!(recv_reply(&mut rx).await?, (7, b"hello nexdb".to_vec()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_segmented_message() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, mut rx) = connect_client(&server, 1).await?;

    // Twelve-plus frames at a 16 KiB segment size.
    let big = pattern(200 * 1024);
    conn.send(&big, 1).await?;
    let (msg_id, echoed) = recv_reply(&mut rx).await?;
    assert_eq!(msg_id, 1);
    assert_eq!(echoed.len(), big.len());
    assert!(echoed == big, "echoed payload differs");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_with_inbound_buffer_of_one_segment() -> Result<()> {
    // Socket reads of 16 KiB land in a buffer that holds a single frame.
    let tight = TransportConfig {
        segment_size: 4096,
        inbound_capacity: 4096,
        outbound_capacity: 64 * 1024,
        ..test_config()
    };
    let server = start_server_with(tight.clone(), Arc::new(Echo), None).await?;
    let (conn, mut rx) = connect_client_with(&server, 1, tight).await?;

    let big = pattern(100 * 1024);
    conn.send(&big, 1).await?;
    conn.send(b"still open", 2).await?;

    let (msg_id, echoed) = recv_reply(&mut rx).await?;
    assert_eq!(msg_id, 1);
    assert!(echoed == big, "echoed payload differs");
    assert_eq!(recv_reply(&mut rx).await?, (2, b"still open".to_vec()));
    assert_eq!(server.pool.list_circuit_ids(), vec![1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_preserves_order() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, mut rx) = connect_client(&server, 1).await?;

    for msg_id in 1..=50u32 {
        conn.send(format!("message {msg_id}").as_bytes(), msg_id).await?;
    }
    for msg_id in 1..=50u32 {
        let (id, body) = recv_reply(&mut rx).await?;
        assert_eq!(id, msg_id);
        assert_eq!(body, format!("message {msg_id}").into_bytes());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_empty_message() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, mut rx) = connect_client(&server, 1).await?;

    conn.send(b"", 3).await?;
    assert_eq!(recv_reply(&mut rx).await?, (3, Vec::new()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversize_send_rejected_locally() -> Result<()> {
    let server = start_echo_server().await?;
    let (conn, _rx) = connect_client(&server, 1).await?;

    let max = test_config().max_message_size;
    let err = conn.send(&vec![0u8; max + 1], 1).await.unwrap_err();
    assert_eq!(
        err,
        nexdb_transport::TransportError::MessageTooLarge { len: max + 1, max }
    );
    assert_eq!(conn.transport().outbound_used(), 0);
    Ok(())
}
