use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use nexum_error::ProtocolError;
use tracing::trace;

use super::op::{Op, RoutedMessage};

/// Максимальная длина управляющей строки по умолчанию.
pub const DEFAULT_MAX_CONTROL_LINE: usize = 1024;

/// Заголовок операции, payload которой ещё не дочитан.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPayload {
    Pub {
        subject: String,
        reply: Option<String>,
    },
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
    },
    Rmsg {
        origin: Arc<str>,
        seq: u64,
        path: Vec<Arc<str>>,
        subject: String,
        reply: Option<String>,
        queues: Vec<Arc<str>>,
    },
}

/// Состояние разбора между вызовами `parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseState {
    /// Ожидается управляющая строка; `scanned` байт уже проверено на `\n`.
    AwaitingLine { scanned: usize },
    /// Заголовок разобран, ожидается `size` байт payload и CRLF.
    AwaitingPayload { header: PendingPayload, size: usize },
    /// Пропуск слишком большого payload (включая завершающий CRLF).
    Discarding { remaining: usize },
}

/// Возобновляемый парсер протокола.
///
/// Работает поверх накопительного `BytesMut`: разобранные байты
/// отрезаются от буфера, неполная команда остаётся в нём до следующего
/// чтения из сокета.
#[derive(Debug)]
pub struct Parser {
    state: ParseState,
    max_control_line: usize,
    max_payload: usize,
}

impl Parser {
    pub fn new(
        max_control_line: usize,
        max_payload: usize,
    ) -> Self {
        Self {
            state: ParseState::AwaitingLine { scanned: 0 },
            max_control_line,
            max_payload,
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    /// Извлекает следующую операцию из буфера.
    ///
    /// `Ok(None)` означает, что данных пока недостаточно.
    pub fn parse(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Op>, ProtocolError> {
        loop {
            let state = std::mem::replace(&mut self.state, ParseState::AwaitingLine { scanned: 0 });

            match state {
                ParseState::AwaitingLine { scanned } => {
                    let Some(pos) = memchr(b'\n', &buf[scanned..]).map(|p| p + scanned) else {
                        if buf.len() > self.max_control_line {
                            return Err(ProtocolError::ControlLineTooLong {
                                max: self.max_control_line,
                            });
                        }
                        self.state = ParseState::AwaitingLine {
                            scanned: buf.len(),
                        };
                        return Ok(None);
                    };

                    let line = buf.split_to(pos + 1);
                    let line = strip_eol(&line);
                    if line.len() > self.max_control_line {
                        return Err(ProtocolError::ControlLineTooLong {
                            max: self.max_control_line,
                        });
                    }
                    if line.is_empty() {
                        continue;
                    }

                    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
                    trace!(line, "<<-");

                    match self.parse_line(line)? {
                        Line::Complete(op) => return Ok(Some(op)),
                        Line::Payload { header, size } => {
                            if size > self.max_payload {
                                self.state = ParseState::Discarding {
                                    remaining: size.saturating_add(2),
                                };
                                return Ok(Some(Op::Oversized {
                                    op: header.op_name(),
                                    size,
                                }));
                            }
                            self.state = ParseState::AwaitingPayload { header, size };
                        }
                    }
                }
                ParseState::AwaitingPayload { header, size } => {
                    if buf.len() < size + 2 {
                        buf.reserve(size + 2 - buf.len());
                        self.state = ParseState::AwaitingPayload { header, size };
                        return Ok(None);
                    }

                    let payload = buf.split_to(size).freeze();
                    if &buf[..2] != b"\r\n" {
                        return Err(ProtocolError::MissingPayloadTerminator {
                            op: header.op_name(),
                        });
                    }
                    buf.advance(2);

                    return Ok(Some(header.into_op(payload)));
                }
                ParseState::Discarding { remaining } => {
                    let n = remaining.min(buf.len());
                    buf.advance(n);
                    if remaining > n {
                        self.state = ParseState::Discarding {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn parse_line(
        &self,
        line: &str,
    ) -> Result<Line, ProtocolError> {
        let (name, rest) = match line.find([' ', '\t']) {
            Some(i) => (&line[..i], line[i..].trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split([' ', '\t']).filter(|s| !s.is_empty()).collect();

        let op = if name.eq_ignore_ascii_case("PUB") {
            let (subject, reply, size) = match args.as_slice() {
                [subject, size] => (subject, None, size),
                [subject, reply, size] => (subject, Some(reply.to_string()), size),
                _ => return Err(invalid_args("PUB", &args)),
            };
            return Ok(Line::Payload {
                header: PendingPayload::Pub {
                    subject: subject.to_string(),
                    reply,
                },
                size: parse_size("PUB", size)?,
            });
        } else if name.eq_ignore_ascii_case("SUB") {
            match args.as_slice() {
                [subject, sid] => Op::Sub {
                    subject: subject.to_string(),
                    queue: None,
                    sid: sid.to_string(),
                },
                [subject, queue, sid] => Op::Sub {
                    subject: subject.to_string(),
                    queue: Some(queue.to_string()),
                    sid: sid.to_string(),
                },
                _ => return Err(invalid_args("SUB", &args)),
            }
        } else if name.eq_ignore_ascii_case("UNSUB") {
            match args.as_slice() {
                [sid] => Op::Unsub {
                    sid: sid.to_string(),
                    max: None,
                },
                [sid, max] => Op::Unsub {
                    sid: sid.to_string(),
                    max: Some(parse_u64("UNSUB", max)?),
                },
                _ => return Err(invalid_args("UNSUB", &args)),
            }
        } else if name.eq_ignore_ascii_case("PING") {
            Op::Ping
        } else if name.eq_ignore_ascii_case("PONG") {
            Op::Pong
        } else if name.eq_ignore_ascii_case("CONNECT") {
            Op::Connect(rest.to_string())
        } else if name.eq_ignore_ascii_case("INFO") {
            Op::Info(rest.to_string())
        } else if name.eq_ignore_ascii_case("MSG") {
            let (subject, sid, reply, size) = match args.as_slice() {
                [subject, sid, size] => (subject, sid, None, size),
                [subject, sid, reply, size] => (subject, sid, Some(reply.to_string()), size),
                _ => return Err(invalid_args("MSG", &args)),
            };
            return Ok(Line::Payload {
                header: PendingPayload::Msg {
                    subject: subject.to_string(),
                    sid: sid.to_string(),
                    reply,
                },
                size: parse_size("MSG", size)?,
            });
        } else if name.eq_ignore_ascii_case("+OK") {
            Op::Ok
        } else if name.eq_ignore_ascii_case("-ERR") {
            Op::Err(rest.trim_matches('\'').to_string())
        } else if name.eq_ignore_ascii_case("SYNC") {
            match args.as_slice() {
                [count] => Op::Sync(parse_u64("SYNC", count)?),
                _ => return Err(invalid_args("SYNC", &args)),
            }
        } else if name.eq_ignore_ascii_case("RS+") {
            match args.as_slice() {
                [origin, rsid, subject] => Op::RsPlus {
                    origin: origin.to_string(),
                    rsid: rsid.to_string(),
                    subject: subject.to_string(),
                    queue: None,
                },
                [origin, rsid, subject, queue] => Op::RsPlus {
                    origin: origin.to_string(),
                    rsid: rsid.to_string(),
                    subject: subject.to_string(),
                    queue: Some(queue.to_string()),
                },
                _ => return Err(invalid_args("RS+", &args)),
            }
        } else if name.eq_ignore_ascii_case("RS-") {
            match args.as_slice() {
                [origin, rsid] => Op::RsMinus {
                    origin: origin.to_string(),
                    rsid: rsid.to_string(),
                },
                _ => return Err(invalid_args("RS-", &args)),
            }
        } else if name.eq_ignore_ascii_case("RMSG") {
            let [origin, seq, path, subject, reply, queues, size] = args.as_slice() else {
                return Err(invalid_args("RMSG", &args));
            };
            return Ok(Line::Payload {
                header: PendingPayload::Rmsg {
                    origin: Arc::from(*origin),
                    seq: parse_u64("RMSG", seq)?,
                    path: split_list(path),
                    subject: subject.to_string(),
                    reply: (*reply != "-").then(|| reply.to_string()),
                    queues: split_list(queues),
                },
                size: parse_size("RMSG", size)?,
            });
        } else {
            return Err(ProtocolError::UnknownOperation {
                op: name.to_string(),
            });
        };

        Ok(Line::Complete(op))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTROL_LINE, 1024 * 1024)
    }
}

enum Line {
    Complete(Op),
    Payload { header: PendingPayload, size: usize },
}

impl PendingPayload {
    fn op_name(&self) -> &'static str {
        match self {
            PendingPayload::Pub { .. } => "PUB",
            PendingPayload::Msg { .. } => "MSG",
            PendingPayload::Rmsg { .. } => "RMSG",
        }
    }

    fn into_op(
        self,
        payload: Bytes,
    ) -> Op {
        match self {
            PendingPayload::Pub { subject, reply } => Op::Pub {
                subject,
                reply,
                payload,
            },
            PendingPayload::Msg {
                subject,
                sid,
                reply,
            } => Op::Msg {
                subject,
                sid,
                reply,
                payload,
            },
            PendingPayload::Rmsg {
                origin,
                seq,
                path,
                subject,
                reply,
                queues,
            } => Op::Rmsg(RoutedMessage {
                origin,
                seq,
                path,
                subject,
                reply,
                queues,
                payload,
            }),
        }
    }
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_list(value: &str) -> Vec<Arc<str>> {
    if value == "-" {
        return Vec::new();
    }
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(Arc::from)
        .collect()
}

fn invalid_args(
    op: &'static str,
    args: &[&str],
) -> ProtocolError {
    ProtocolError::InvalidArguments {
        op,
        reason: format!("unexpected argument count {}", args.len()),
    }
}

fn parse_u64(
    op: &'static str,
    value: &str,
) -> Result<u64, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidNumber {
        op,
        value: value.to_string(),
    })
}

fn parse_size(
    op: &'static str,
    value: &str,
) -> Result<usize, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidNumber {
        op,
        value: value.to_string(),
    })
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(
        parser: &mut Parser,
        buf: &mut BytesMut,
    ) -> Vec<Op> {
        let mut ops = Vec::new();
        while let Some(op) = parser.parse(buf).expect("parse") {
            ops.push(op);
        }
        ops
    }

    /// Тест проверяет разбор базового набора клиентских операций.
    #[test]
    fn test_parse_client_ops() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(
            &b"CONNECT {\"verbose\":false}\r\nsub foo.* q 1\r\nPUB foo.bar INBOX.1 5\r\nhello\r\nUNSUB 1 10\r\nPING\r\npong\r\n"[..],
        );

        let ops = parse_all(&mut parser, &mut buf);
        assert_eq!(
            ops,
            vec![
                Op::Connect("{\"verbose\":false}".into()),
                Op::Sub {
                    subject: "foo.*".into(),
                    queue: Some("q".into()),
                    sid: "1".into(),
                },
                Op::Pub {
                    subject: "foo.bar".into(),
                    reply: Some("INBOX.1".into()),
                    payload: Bytes::from_static(b"hello"),
                },
                Op::Unsub {
                    sid: "1".into(),
                    max: Some(10),
                },
                Op::Ping,
                Op::Pong,
            ]
        );
        assert!(buf.is_empty());
    }

    /// Тест проверяет устойчивость к разбиению команды на произвольные
    /// фрагменты, включая побайтовую подачу.
    #[test]
    fn test_partial_reads_byte_by_byte() {
        let input = b"PUB a.b 11\r\nhello world\r\nPING\r\n";
        let mut parser = Parser::default();
        let mut buf = BytesMut::new();
        let mut ops = Vec::new();

        for byte in input {
            buf.extend_from_slice(&[*byte]);
            while let Some(op) = parser.parse(&mut buf).expect("parse") {
                ops.push(op);
            }
        }

        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0],
            Op::Pub {
                subject: "a.b".into(),
                reply: None,
                payload: Bytes::from_static(b"hello world"),
            }
        );
        assert_eq!(ops[1], Op::Ping);
    }

    /// Тест проверяет, что payload может содержать CRLF.
    #[test]
    fn test_payload_with_crlf() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(&b"PUB x 4\r\n\r\n\r\n\r\n"[..]);
        let op = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(
            op,
            Op::Pub {
                subject: "x".into(),
                reply: None,
                payload: Bytes::from_static(b"\r\n\r\n"),
            }
        );
    }

    /// Тест проверяет, что слишком большой payload пропускается и поток
    /// остаётся синхронизированным.
    #[test]
    fn test_oversized_payload_is_discarded() {
        let mut parser = Parser::new(DEFAULT_MAX_CONTROL_LINE, 4);
        let mut buf = BytesMut::from(&b"PUB a 10\r\n0123"[..]);

        assert_eq!(
            parser.parse(&mut buf).unwrap(),
            Some(Op::Oversized { op: "PUB", size: 10 })
        );
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert!(matches!(parser.state(), ParseState::Discarding { remaining: 8 }));

        buf.extend_from_slice(b"456789\r\nPING\r\n");
        assert_eq!(parser.parse(&mut buf).unwrap(), Some(Op::Ping));
    }

    /// Тест проверяет, что размер `usize::MAX` не переполняет счётчик
    /// отбрасываемых байт: парсер сообщает Oversized и поглощает остаток.
    #[test]
    fn test_max_size_payload_does_not_overflow() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(&b"PUB a 18446744073709551615\r\nPING\r\n"[..]);

        assert_eq!(
            parser.parse(&mut buf).unwrap(),
            Some(Op::Oversized {
                op: "PUB",
                size: usize::MAX,
            })
        );
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
        assert!(matches!(
            parser.state(),
            ParseState::Discarding { remaining } if *remaining == usize::MAX - 6
        ));
    }

    #[test]
    fn test_unknown_operation() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(&b"FOO bar\r\n"[..]);
        let err = parser.parse(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOperation { op: "FOO".into() });
    }

    #[test]
    fn test_bad_arguments() {
        for input in [
            &b"PUB\r\n"[..],
            b"PUB a b c d\r\n",
            b"PUB a x\r\n",
            b"SUB a\r\n",
            b"UNSUB\r\n",
            b"UNSUB 1 z\r\n",
        ] {
            let mut parser = Parser::default();
            let mut buf = BytesMut::from(input);
            assert!(parser.parse(&mut buf).is_err(), "input={:?}", input);
        }
    }

    /// Тест проверяет лимит длины управляющей строки как для полной, так и
    /// для ещё не завершённой строки.
    #[test]
    fn test_control_line_limit() {
        let mut parser = Parser::new(16, 1024);
        let mut buf = BytesMut::from(&b"SUB a.very.long.subject.name 1\r\n"[..]);
        assert_eq!(
            parser.parse(&mut buf).unwrap_err(),
            ProtocolError::ControlLineTooLong { max: 16 }
        );

        let mut parser = Parser::new(16, 1024);
        let mut buf = BytesMut::from(&b"SUB aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_missing_payload_terminator() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(&b"PUB a 2\r\nhiXX"[..]);
        assert!(matches!(
            parser.parse(&mut buf),
            Err(ProtocolError::MissingPayloadTerminator { op: "PUB" })
        ));
    }

    /// Тест проверяет разбор маршрутных операций.
    #[test]
    fn test_parse_route_ops() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(
            &b"SYNC 2\r\nRS+ A 1:2 foo.> workers\r\nRS- A 1:2\r\nRMSG A 7 A,B foo.bar - workers,other 3\r\nabc\r\n"[..],
        );
        let ops = parse_all(&mut parser, &mut buf);
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], Op::Sync(2));
        assert_eq!(
            ops[1],
            Op::RsPlus {
                origin: "A".into(),
                rsid: "1:2".into(),
                subject: "foo.>".into(),
                queue: Some("workers".into()),
            }
        );
        let Op::Rmsg(msg) = &ops[3] else {
            panic!("expected RMSG, got {:?}", ops[3]);
        };
        assert_eq!(&*msg.origin, "A");
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.path.len(), 2);
        assert_eq!(msg.reply, None);
        assert_eq!(msg.queues.len(), 2);
        assert_eq!(msg.payload, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_parse_server_lines() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(
            &b"MSG foo 1 bar 2\r\nhi\r\n+OK\r\n-ERR 'Unknown Protocol Operation'\r\n"[..],
        );
        let ops = parse_all(&mut parser, &mut buf);
        assert_eq!(
            ops,
            vec![
                Op::Msg {
                    subject: "foo".into(),
                    sid: "1".into(),
                    reply: Some("bar".into()),
                    payload: Bytes::from_static(b"hi"),
                },
                Op::Ok,
                Op::Err("Unknown Protocol Operation".into()),
            ]
        );
    }

    #[test]
    fn test_bare_newline_and_empty_lines() {
        let mut parser = Parser::default();
        let mut buf = BytesMut::from(&b"\r\nPING\nPONG\r\n"[..]);
        let ops = parse_all(&mut parser, &mut buf);
        assert_eq!(ops, vec![Op::Ping, Op::Pong]);
    }
}
