//! Кодирование исходящих строк протокола.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::op::RoutedMessage;

pub const CRLF: &[u8] = b"\r\n";
pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"+OK\r\n";

/// `-ERR '<message>'`
pub fn err_line(message: &str) -> Bytes {
    Bytes::from(format!("-ERR '{message}'\r\n"))
}

/// `INFO {json}` / `CONNECT {json}`.
pub fn json_line<T: Serialize>(
    op: &str,
    value: &T,
) -> Bytes {
    // Сериализация простых структур со строками и числами не падает.
    let json = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("{op} {json}\r\n"))
}

/// `MSG <subject> <sid> [reply] <#bytes>\r\n<payload>\r\n`
pub fn write_msg(
    buf: &mut BytesMut,
    subject: &str,
    sid: &str,
    reply: Option<&str>,
    payload: &[u8],
) {
    buf.reserve(subject.len() + sid.len() + payload.len() + 32);
    buf.put_slice(b"MSG ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(sid.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}

/// `SYNC <count>`
pub fn sync_line(count: usize) -> Bytes {
    Bytes::from(format!("SYNC {count}\r\n"))
}

/// `RS+ <origin> <rsid> <subject> [queue]`
pub fn rs_plus_line(
    origin: &str,
    rsid: &str,
    subject: &str,
    queue: Option<&str>,
) -> Bytes {
    match queue {
        Some(q) => Bytes::from(format!("RS+ {origin} {rsid} {subject} {q}\r\n")),
        None => Bytes::from(format!("RS+ {origin} {rsid} {subject}\r\n")),
    }
}

/// `RS- <origin> <rsid>`
pub fn rs_minus_line(
    origin: &str,
    rsid: &str,
) -> Bytes {
    Bytes::from(format!("RS- {origin} {rsid}\r\n"))
}

/// `RMSG <origin> <seq> <path> <subject> <reply|-> <queues|-> <#bytes>`
pub fn write_rmsg(
    buf: &mut BytesMut,
    msg: &RoutedMessage,
) {
    let path = join_list(&msg.path);
    let queues = join_list(&msg.queues);
    let header = format!(
        "RMSG {} {} {} {} {} {} {}\r\n",
        msg.origin,
        msg.seq,
        path,
        msg.subject,
        msg.reply.as_deref().unwrap_or("-"),
        queues,
        msg.payload.len()
    );
    buf.reserve(header.len() + msg.payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(&msg.payload);
    buf.put_slice(CRLF);
}

fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}
