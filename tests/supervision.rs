mod common;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use fanout_rpc::{
    //
    create_memory_transport_with_hub,
    MemoryHub,
    Result,
    RpcError,
};

use common::*;

#[tokio::test]
async fn test_server_reconnects_after_stream_closure() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = start_server(&hub).await?;
    let client = start_client(&hub).await?;
    let ctx = CancellationToken::new();

    let pong: String = client.remote_call(&ctx, "ping", &()).await?;
    assert_eq!(pong, "pong");

    assert_eq!(hub.disconnect(SERVER_EXCHANGE).await, 1);
    eventually("server queue rebound", || {
        let hub = hub.clone();
        async move { hub.queue_count(SERVER_EXCHANGE).await == 1 }
    })
    .await;

    let pong: String = client.remote_call(&ctx, "ping", &()).await?;
    assert_eq!(pong, "pong");

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_client_reconnects_after_stream_closure() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = start_server(&hub).await?;
    let client = start_client(&hub).await?;
    let ctx = CancellationToken::new();

    hub.disconnect(CLIENT_EXCHANGE).await;
    eventually("client queue rebound", || {
        let hub = hub.clone();
        async move { hub.queue_count(CLIENT_EXCHANGE).await == 1 }
    })
    .await;

    let tag: u32 = client
        .remote_call(&ctx, "delay", &Delay { ms: 0, tag: 3 })
        .await?;
    assert_eq!(tag, 3);

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_reconnect_is_reported_once() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = start_server(&hub).await?;
    let client = start_client(&hub).await?;
    let mut notify = server.notify();

    hub.set_available(false);
    hub.disconnect(SERVER_EXCHANGE).await;

    let fatal = tokio::time::timeout(Duration::from_secs(2), notify.recv())
        .await
        .expect("no fatal notification");
    assert!(
        matches!(fatal, Some(RpcError::ConnectionFailed(_))),
        "unexpected: {fatal:?}"
    );
    assert!(notify.recv().await.is_none());

    // The dead server consumes nothing, even once the broker is back.
    hub.set_available(true);
    let err = client
        .remote_call::<_, String>(&CancellationToken::new(), "ping", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout), "unexpected: {err:?}");
    assert_eq!(hub.queue_count(SERVER_EXCHANGE).await, 0);

    // Shutdown after a fatal error is a no-op.
    let started = Instant::now();
    server.shutdown().await?;
    assert!(started.elapsed() < TIMEOUT);
    assert!(matches!(server.start(), Err(RpcError::ConnectionClosed)));

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_client_fatal_error_fails_calls() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let client = start_client(&hub).await?;
    let mut notify = client.notify();

    hub.set_available(false);
    hub.disconnect(CLIENT_EXCHANGE).await;

    let fatal = tokio::time::timeout(Duration::from_secs(2), notify.recv())
        .await
        .expect("no fatal notification");
    assert!(fatal.is_some());
    assert!(notify.try_recv().is_none());

    let err = client
        .remote_call::<_, String>(&CancellationToken::new(), "ping", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed), "unexpected: {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_call_after_shutdown_is_connection_closed() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = start_server(&hub).await?;
    let client = start_client(&hub).await?;

    client.shutdown().await?;
    assert_eq!(hub.queue_count(CLIENT_EXCHANGE).await, 0);

    let started = Instant::now();
    let err = client
        .remote_call::<_, String>(&CancellationToken::new(), "ping", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed), "unexpected: {err:?}");
    assert!(started.elapsed() < TIMEOUT);

    // Repeated shutdown returns immediately.
    let started = Instant::now();
    client.shutdown().await?;
    assert!(started.elapsed() < TIMEOUT);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_reply_land() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = start_server(&hub).await?;
    let client = start_client(&hub).await?;

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .remote_call::<_, u32>(&CancellationToken::new(), "delay", &Delay { ms: 100, tag: 9 })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let started = Instant::now();
    server.shutdown().await?;
    assert!(started.elapsed() >= TIMEOUT, "shutdown skipped the grace delay");

    assert_eq!(call.await.expect("call task panicked")?, 9);
    assert_eq!(hub.queue_count(SERVER_EXCHANGE).await, 0);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_run_returns_after_shutdown() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let config = config("server");
    let transport = fanout_rpc::create_memory_transport_with_hub(&config, hub.clone());
    let server = fanout_rpc::RpcServer::with_transport(
        transport,
        SERVER_EXCHANGE,
        wallet_router(Default::default()),
        &config,
    )
    .await?;

    let running = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let client = start_client(&hub).await?;
    let pong: String = client
        .remote_call(&CancellationToken::new(), "ping", &())
        .await?;
    assert_eq!(pong, "pong");

    server.shutdown().await?;
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run did not return")
        .expect("run task panicked");
    assert!(outcome.is_ok());

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_run_returns_fatal_error() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let config = config("server");
    let transport = fanout_rpc::create_memory_transport_with_hub(&config, hub.clone());
    let server = fanout_rpc::RpcServer::with_transport(
        transport,
        SERVER_EXCHANGE,
        wallet_router(Default::default()),
        &config,
    )
    .await?;

    let running = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    eventually("server consuming", || {
        let hub = hub.clone();
        async move { hub.queue_count(SERVER_EXCHANGE).await == 1 }
    })
    .await;

    hub.set_available(false);
    hub.disconnect(SERVER_EXCHANGE).await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run did not return")
        .expect("run task panicked");
    assert!(matches!(outcome, Err(RpcError::ConnectionFailed(_))));
    Ok(())
}

#[tokio::test]
async fn test_initial_connect_exhausts_budget() {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    hub.set_available(false);

    let started = Instant::now();
    let err = start_client(&hub).await.err().expect("connect should fail");
    assert!(matches!(err, RpcError::ConnectionFailed(_)), "unexpected: {err:?}");
    // Three attempts, each followed by the 20ms pause.
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_repeated_start_keeps_worker_pool_bounded() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let config = config("server").with_workers(1);
    let transport = create_memory_transport_with_hub(&config, hub.clone());
    let server = fanout_rpc::RpcServer::with_transport(
        transport,
        SERVER_EXCHANGE,
        wallet_router(Default::default()),
        &config,
    )
    .await?;

    server.start()?;
    server.start()?;
    let running = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let client = start_client(&hub).await?;

    // One worker serves the two calls back to back.
    let ctx = CancellationToken::new();
    let first = Delay { ms: 120, tag: 1 };
    let second = Delay { ms: 120, tag: 2 };

    let started = Instant::now();
    let (a, b) = tokio::join!(
        client.remote_call::<_, u32>(&ctx, "delay", &first),
        client.remote_call::<_, u32>(&ctx, "delay", &second),
    );
    assert_eq!((a?, b?), (1, 2));
    assert!(
        started.elapsed() >= Duration::from_millis(240),
        "handlers overlapped: {:?}",
        started.elapsed()
    );

    server.shutdown().await?;
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run did not return")
        .expect("run task panicked");
    assert!(outcome.is_ok());

    client.shutdown().await?;
    Ok(())
}
