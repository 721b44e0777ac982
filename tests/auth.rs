mod common;

use anyhow::Result;
use common::{client_addr, start_server, test_options, TestClient};
use nexum::hash_password;

/// Тест проверяет вход по имени и паролю.
#[tokio::test]
async fn test_user_password() -> Result<()> {
    let mut opts = test_options();
    opts.username = Some("derek".into());
    opts.password = Some("s3cr3t".into());
    let server = start_server(opts).await?;
    let addr = client_addr(&server)?;

    let mut good = TestClient::connect_raw(addr).await?;
    assert!(good.info.contains(r#""auth_required":true"#));
    good.send("CONNECT {\"user\":\"derek\",\"pass\":\"s3cr3t\"}\r\n")
        .await?;
    good.expect_line("+OK").await?;

    let mut bad = TestClient::connect_raw(addr).await?;
    bad.send("CONNECT {\"user\":\"derek\",\"pass\":\"wrong\"}\r\n")
        .await?;
    bad.expect_line("-ERR 'Authorization Violation'").await?;
    bad.expect_closed().await?;

    let mut anonymous = TestClient::connect_raw(addr).await?;
    anonymous.send("CONNECT {}\r\n").await?;
    anonymous
        .expect_line("-ERR 'Authorization Violation'")
        .await?;
    anonymous.expect_closed().await?;

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_token() -> Result<()> {
    let mut opts = test_options();
    opts.authorization = Some("T0K3N".into());
    let server = start_server(opts).await?;
    let addr = client_addr(&server)?;

    let mut good = TestClient::connect_raw(addr).await?;
    good.send("CONNECT {\"auth_token\":\"T0K3N\"}\r\n").await?;
    good.expect_line("+OK").await?;

    let mut bad = TestClient::connect_raw(addr).await?;
    bad.send("CONNECT {\"auth_token\":\"nope\"}\r\n").await?;
    bad.expect_line("-ERR 'Authorization Violation'").await?;
    bad.expect_closed().await?;

    server.shutdown();
    Ok(())
}

/// Тест проверяет пароль, заданный argon2-хэшем.
#[tokio::test]
async fn test_hashed_password() -> Result<()> {
    let mut opts = test_options();
    opts.username = Some("derek".into());
    opts.password = Some(hash_password("s3cr3t")?);
    let server = start_server(opts).await?;
    let addr = client_addr(&server)?;

    let mut good = TestClient::connect_raw(addr).await?;
    good.send("CONNECT {\"user\":\"derek\",\"pass\":\"s3cr3t\"}\r\n")
        .await?;
    good.expect_line("+OK").await?;

    server.shutdown();
    Ok(())
}

/// Тест проверяет повторный CONNECT: учётные данные проверяются заново.
#[tokio::test]
async fn test_reconnect_refreshes_credentials() -> Result<()> {
    let mut opts = test_options();
    opts.username = Some("derek".into());
    opts.password = Some("s3cr3t".into());
    let server = start_server(opts).await?;
    let addr = client_addr(&server)?;

    let mut client = TestClient::connect_with(
        addr,
        r#"{"verbose":false,"user":"derek","pass":"s3cr3t"}"#,
    )
    .await?;
    client
        .send("CONNECT {\"verbose\":true,\"user\":\"derek\",\"pass\":\"s3cr3t\"}\r\n")
        .await?;
    client.expect_line("+OK").await?;

    client
        .send("CONNECT {\"user\":\"derek\",\"pass\":\"stolen\"}\r\n")
        .await?;
    client
        .expect_line("-ERR 'Authorization Violation'")
        .await?;
    client.expect_closed().await?;

    server.shutdown();
    Ok(())
}
