use std::{fmt, sync::Arc};

use bytes::Bytes;

/// Разобранная операция протокола.
///
/// Один тип покрывает и клиентские, и маршрутные операции; сессия сама
/// решает, какие из них допустимы для её вида.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `CONNECT {json}`
    Connect(String),
    /// `INFO {json}`
    Info(String),
    /// `PUB <subject> [reply] <#bytes>`
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    /// `SUB <subject> [queue] <sid>`
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    /// `UNSUB <sid> [max_msgs]`
    Unsub { sid: String, max: Option<u64> },
    /// `MSG <subject> <sid> [reply] <#bytes>`
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    /// `+OK`
    Ok,
    /// `-ERR '<message>'`
    Err(String),
    /// Payload больше допустимого: байты будут пропущены парсером.
    Oversized { op: &'static str, size: usize },
    /// `SYNC <count>`
    Sync(u64),
    /// `RS+ <origin> <rsid> <subject> [queue]`
    RsPlus {
        origin: String,
        rsid: String,
        subject: String,
        queue: Option<String>,
    },
    /// `RS- <origin> <rsid>`
    RsMinus { origin: String, rsid: String },
    /// `RMSG ...`
    Rmsg(RoutedMessage),
}

/// Сообщение, пересылаемое между серверами кластера.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Сервер, на котором сообщение было опубликовано.
    pub origin: Arc<str>,
    /// Порядковый номер публикации на `origin`.
    pub seq: u64,
    /// Серверы, которые уже получили (или получают) это сообщение.
    pub path: Vec<Arc<str>>,
    pub subject: String,
    pub reply: Option<String>,
    /// Группы очередей, которые обслуживает получатель.
    pub queues: Vec<Arc<str>>,
    pub payload: Bytes,
}

impl Op {
    /// Имя операции для логов и ошибок.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Connect(_) => "CONNECT",
            Op::Info(_) => "INFO",
            Op::Pub { .. } => "PUB",
            Op::Sub { .. } => "SUB",
            Op::Unsub { .. } => "UNSUB",
            Op::Msg { .. } => "MSG",
            Op::Ping => "PING",
            Op::Pong => "PONG",
            Op::Ok => "+OK",
            Op::Err(_) => "-ERR",
            Op::Oversized { op, .. } => *op,
            Op::Sync(_) => "SYNC",
            Op::RsPlus { .. } => "RS+",
            Op::RsMinus { .. } => "RS-",
            Op::Rmsg(_) => "RMSG",
        }
    }
}

impl RoutedMessage {
    /// Проверяет, проходило ли сообщение через указанный сервер.
    pub fn visited(
        &self,
        server_id: &str,
    ) -> bool {
        &*self.origin == server_id || self.path.iter().any(|id| &**id == server_id)
    }
}

impl fmt::Display for Op {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Op::Pub { subject, payload, .. } => write!(f, "PUB {subject} ({} bytes)", payload.len()),
            Op::Sub {
                subject, queue, sid, ..
            } => match queue {
                Some(q) => write!(f, "SUB {subject} {q} {sid}"),
                None => write!(f, "SUB {subject} {sid}"),
            },
            Op::Unsub { sid, max } => match max {
                Some(m) => write!(f, "UNSUB {sid} {m}"),
                None => write!(f, "UNSUB {sid}"),
            },
            Op::Rmsg(m) => write!(f, "RMSG {} {} {} ({} bytes)", m.origin, m.seq, m.subject, m.payload.len()),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visited() {
        let msg = RoutedMessage {
            origin: Arc::from("A"),
            seq: 1,
            path: vec![Arc::from("A"), Arc::from("B")],
            subject: "foo".into(),
            reply: None,
            queues: vec![],
            payload: Bytes::new(),
        };
        assert!(msg.visited("A"));
        assert!(msg.visited("B"));
        assert!(!msg.visited("C"));
    }

    #[test]
    fn test_display_hides_payload() {
        let op = Op::Pub {
            subject: "a.b".into(),
            reply: None,
            payload: Bytes::from_static(b"secret"),
        };
        assert_eq!(op.to_string(), "PUB a.b (6 bytes)");
    }
}
