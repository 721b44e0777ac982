mod common;

use std::time::Duration;

use anyhow::Result;
use common::{client_addr, start_server, test_options, wait_until, TestClient};
use nexum::SessionKind;

/// Тест проверяет выселение подписчика, который не читает сокет, и то, что
/// издатель и остальные подписчики продолжают работать.
#[tokio::test]
async fn test_slow_consumer_is_evicted() -> Result<()> {
    let mut opts = test_options();
    opts.max_payload = 1024;
    opts.max_pending_bytes = 8 * 1024;
    let server = start_server(opts).await?;
    let addr = client_addr(&server)?;

    // Подписчик, который никогда не читает.
    let mut stalled = TestClient::connect(addr).await?;
    stalled.send("SUB flood 1\r\n").await?;
    stalled.flush().await?;

    let mut healthy = TestClient::connect(addr).await?;
    healthy.send("SUB flood.done 1\r\n").await?;
    healthy.flush().await?;

    let mut publisher = TestClient::connect(addr).await?;
    let payload = "x".repeat(1000);
    let mut evicted = false;
    for _ in 0..200 {
        for _ in 0..100 {
            publisher.publish("flood", &payload).await?;
        }
        publisher.flush().await?;
        if server.stats().slow_consumers() > 0 {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "subscriber was never evicted");

    assert!(
        wait_until(Duration::from_secs(2), || {
            server.connz().num_connections == 2
        })
        .await
    );
    let connz = server.connz();
    assert!(connz
        .connections
        .iter()
        .all(|c| c.kind == SessionKind::Client));

    publisher.publish("flood.done", "ok").await?;
    let msg = healthy.read_msg().await?;
    assert_eq!(msg.payload, b"ok");
    publisher.flush().await?;

    drop(stalled);
    server.shutdown();
    Ok(())
}
