//! Общие помощники интеграционных тестов: запуск сервера и текстовый клиент.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use nexum::{Options, Server};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::{sleep, timeout},
};

/// Сколько ждать строку от сервера.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Конфигурация для тестов: loopback, свободные порты, быстрый дозвон.
pub fn test_options() -> Options {
    Options {
        host: "127.0.0.1".into(),
        port: 0,
        cluster_host: "127.0.0.1".into(),
        cluster_port: None,
        ping_interval: Duration::from_secs(60),
        route_reconnect_base: Duration::from_millis(20),
        route_reconnect_max: Duration::from_millis(200),
        logtime: false,
        ..Default::default()
    }
}

pub async fn start_server(opts: Options) -> Result<Arc<Server>> {
    let server = Server::new(opts)?;
    server.start().await?;
    Ok(server)
}

/// Узел кластера, который сам дозванивается до `peers`.
pub async fn start_cluster_node(peers: &[&Arc<Server>]) -> Result<Arc<Server>> {
    let mut opts = test_options();
    opts.cluster_port = Some(0);
    for peer in peers {
        let addr = peer
            .cluster_addr()
            .ok_or_else(|| anyhow!("peer has no cluster listener"))?;
        opts.routes.push(format!("nats-route://{addr}"));
    }
    start_server(opts).await
}

pub fn client_addr(server: &Server) -> Result<SocketAddr> {
    server
        .client_addr()
        .ok_or_else(|| anyhow!("server is not listening"))
}

/// Ждёт выполнения условия; `false` по таймауту.
pub async fn wait_until<F>(
    limit: Duration,
    mut cond: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Полученное `MSG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub subject: String,
    pub sid: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Клиент, говорящий на текстовом протоколе напрямую через сокет.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub info: String,
}

impl TestClient {
    /// Подключается и читает `INFO`, но не отправляет CONNECT.
    pub async fn connect_raw(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
            info: String::new(),
        };
        let info = client.read_line().await?;
        if !info.starts_with("INFO ") {
            bail!("expected INFO, got {info:?}");
        }
        client.info = info;
        Ok(client)
    }

    /// Подключается в тихом режиме (`verbose: false`).
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, r#"{"verbose":false}"#).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        connect_json: &str,
    ) -> Result<Self> {
        let mut client = Self::connect_raw(addr).await?;
        client.send(&format!("CONNECT {connect_json}\r\n")).await?;
        client.flush().await?;
        Ok(client)
    }

    pub async fn send(
        &mut self,
        data: &str,
    ) -> Result<()> {
        self.writer.write_all(data.as_bytes()).await?;
        Ok(())
    }

    pub async fn publish(
        &mut self,
        subject: &str,
        payload: &str,
    ) -> Result<()> {
        self.send(&format!("PUB {subject} {}\r\n{payload}\r\n", payload.len()))
            .await
    }

    /// Строка без `\r\n`; ошибка, если сервер закрыл соединение.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await??;
        if n == 0 {
            bail!("connection closed by server");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn expect_line(
        &mut self,
        expected: &str,
    ) -> Result<()> {
        let line = self.read_line().await?;
        if line != expected {
            bail!("expected {expected:?}, got {line:?}");
        }
        Ok(())
    }

    /// PING/PONG: всё отправленное ранее сервер уже обработал.
    pub async fn flush(&mut self) -> Result<()> {
        self.send("PING\r\n").await?;
        self.expect_line("PONG").await
    }

    pub async fn read_msg(&mut self) -> Result<Msg> {
        let line = self.read_line().await?;
        let (mut msg, size) = parse_msg_line(&line)?;
        let mut payload = vec![0u8; size + 2];
        timeout(READ_TIMEOUT, self.reader.read_exact(&mut payload)).await??;
        if &payload[size..] != b"\r\n" {
            bail!("payload is not terminated by CRLF");
        }
        payload.truncate(size);
        msg.payload = payload;
        Ok(msg)
    }

    /// Читает сообщения, пока сервер молчит не дольше `quiet`.
    pub async fn drain_msgs(
        &mut self,
        quiet: Duration,
    ) -> Result<Vec<Msg>> {
        let mut msgs = Vec::new();
        loop {
            let mut line = String::new();
            match timeout(quiet, self.reader.read_line(&mut line)).await {
                Err(_) => return Ok(msgs),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => bail!("connection closed by server"),
                Ok(Ok(_)) => {
                    let line = line.trim_end_matches(['\r', '\n']);
                    let (mut msg, size) = parse_msg_line(line)?;
                    let mut payload = vec![0u8; size + 2];
                    timeout(READ_TIMEOUT, self.reader.read_exact(&mut payload)).await??;
                    payload.truncate(size);
                    msg.payload = payload;
                    msgs.push(msg);
                }
            }
        }
    }

    /// Проверяет, что за `window` сервер ничего не прислал.
    pub async fn expect_silence(
        &mut self,
        window: Duration,
    ) -> Result<()> {
        let mut line = String::new();
        match timeout(window, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => bail!("connection closed by server"),
            Ok(Ok(_)) => bail!("unexpected data: {line:?}"),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Ждёт закрытия соединения, пропуская оставшиеся строки.
    pub async fn expect_closed(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match timeout(READ_TIMEOUT, self.reader.read(&mut buf)).await {
                Err(_) => bail!("connection was not closed"),
                Ok(Ok(0)) | Ok(Err(_)) => return Ok(()),
                Ok(Ok(_)) => {}
            }
        }
    }
}

/// `MSG <subject> <sid> [reply] <#bytes>` → сообщение без payload и размер.
fn parse_msg_line(line: &str) -> Result<(Msg, usize)> {
    let args: Vec<&str> = line.split_whitespace().collect();
    let (subject, sid, reply, size) = match args.as_slice() {
        ["MSG", subject, sid, size] => (subject, sid, None, size),
        ["MSG", subject, sid, reply, size] => (subject, sid, Some(reply.to_string()), size),
        _ => bail!("expected MSG, got {line:?}"),
    };
    Ok((
        Msg {
            subject: subject.to_string(),
            sid: sid.to_string(),
            reply,
            payload: Vec::new(),
        },
        size.parse()?,
    ))
}
