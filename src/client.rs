//! Клиентская сессия: конечный автомат протокола.
//!
//! `AwaitingHandshake → Authenticating → Connected → Closing → Closed`.
//! Чтение и разбор команд идут в задаче сессии, запись в сокет выполняет
//! отдельная задача через ограниченный исходящий буфер.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nexum_error::{NexumResult, ProtocolError, SessionError, StackError, SubscriptionError};
use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt,
    net::tcp::OwnedReadHalf,
    select,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::{
    auth::Credentials,
    protocol::{err_line, parse_json, write_msg, ClientConnect, Op, Parser, OK, PING, PONG},
    registry::{SubscribeRequest, Subscription},
    server::{close_reason_for, log_error, Server},
    session::{
        wait_closed, CloseReason, ConnectionState, Heartbeat, OutboundError, Session, SessionCore,
        SessionKind, READ_BUFFER_SIZE,
    },
    subject,
};

/// Флаги, согласованные в последнем CONNECT.
#[derive(Debug, Clone, Default)]
struct ClientFlags {
    verbose: bool,
    pedantic: bool,
    name: Option<String>,
    lang: Option<String>,
    version: Option<String>,
}

/// Соединение клиента.
pub struct ClientSession {
    core: SessionCore,
    server: Arc<Server>,
    me: Weak<ClientSession>,
    flags: Mutex<ClientFlags>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ClientSession {
    pub(crate) fn new(
        server: Arc<Server>,
        cid: u64,
        addr: SocketAddr,
    ) -> Arc<Self> {
        let opts = server.opts();
        let core = SessionCore::new(
            cid,
            addr,
            opts.max_pending_bytes,
            opts.max_pending_msgs,
            opts.write_deadline,
        );
        Arc::new_cyclic(|me| Self {
            core,
            server,
            me: me.clone(),
            flags: Mutex::new(ClientFlags::default()),
        })
    }

    /// `INFO`, отправляемый сразу после accept.
    pub(crate) fn send_info(&self) {
        self.enqueue(&self.server.client_info_line());
    }

    /// Ставит управляющую строку в очередь; переполнение выселяет клиента.
    fn enqueue(
        &self,
        data: &[u8],
    ) {
        match self.core.send(data) {
            Ok(()) | Err(OutboundError::Closed) => {}
            Err(e) => self.server.evict_slow_consumer(self, &e.to_string()),
        }
    }

    fn is_connected(&self) -> bool {
        self.core.state.get() == ConnectionState::Connected
    }

    fn pedantic(&self) -> bool {
        self.flags.lock().pedantic
    }

    fn ack(&self) {
        if self.flags.lock().verbose {
            self.enqueue(OK);
        }
    }

    /// Обрабатывает накопленные байты; `false`, если сессия закрыта.
    fn process_buffer(
        &self,
        parser: &mut Parser,
        buf: &mut BytesMut,
    ) -> bool {
        loop {
            if self.core.is_closed() {
                return false;
            }
            let op = match parser.parse(buf) {
                Ok(Some(op)) => op,
                Ok(None) => return true,
                Err(e) => {
                    self.fail(StackError::new(e));
                    return false;
                }
            };
            trace!(cid = self.core.id, op = %op, "<-");
            if let Err(e) = self.process_op(op) {
                if !self.fail(e) {
                    return false;
                }
            }
        }
    }

    fn process_op(
        &self,
        op: Op,
    ) -> NexumResult<()> {
        if !self.is_connected() {
            return match op {
                Op::Connect(raw) => self.on_connect(&raw),
                other => Err(ProtocolError::ExpectedConnect {
                    op: other.name().to_string(),
                }
                .into()),
            };
        }

        match op {
            Op::Connect(raw) => self.on_connect(&raw),
            Op::Pub {
                subject,
                reply,
                payload,
            } => self.on_pub(&subject, reply.as_deref(), payload),
            Op::Sub {
                subject,
                queue,
                sid,
            } => self.on_sub(&subject, queue.as_deref(), &sid),
            Op::Unsub { sid, max } => self.on_unsub(&sid, max),
            Op::Ping => {
                self.enqueue(PONG);
                Ok(())
            }
            Op::Pong => {
                self.core.pong_received();
                Ok(())
            }
            Op::Oversized { size, .. } => Err(SessionError::MaxPayload {
                size,
                max: self.server.opts().max_payload,
            }
            .into()),
            other => Err(ProtocolError::NotAllowed {
                op: other.name().to_string(),
            }
            .into()),
        }
    }

    /// CONNECT: первичное рукопожатие или обновление учётных данных.
    fn on_connect(
        &self,
        raw: &str,
    ) -> NexumResult<()> {
        let connect: ClientConnect = parse_json("CONNECT", raw)?;
        let refresh = self.is_connected();
        if !refresh {
            self.core.state.set(ConnectionState::Authenticating);
        }

        self.server.client_auth().check(Credentials {
            user: connect.user.as_deref(),
            pass: connect.pass.as_deref(),
            token: connect.auth_token.as_deref(),
        })?;

        *self.flags.lock() = ClientFlags {
            verbose: connect.verbose,
            pedantic: connect.pedantic,
            name: connect.name,
            lang: connect.lang,
            version: connect.version,
        };
        self.core.state.set(ConnectionState::Connected);
        debug!(
            cid = self.core.id,
            refresh,
            verbose = connect.verbose,
            pedantic = connect.pedantic,
            "client connected"
        );
        self.ack();
        Ok(())
    }

    fn on_pub(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> NexumResult<()> {
        let valid = if self.pedantic() {
            subject::is_valid_literal_subject(subject)
        } else {
            !subject.is_empty() && subject::tokens(subject).all(|t| !t.is_empty())
        };
        if !valid {
            return Err(SubscriptionError::InvalidPublishSubject {
                subject: subject.to_string(),
            }
            .into());
        }

        self.core.stats.record_in(payload.len());
        self.server.publish(subject, reply, &payload);
        self.ack();
        Ok(())
    }

    fn on_sub(
        &self,
        subject: &str,
        queue: Option<&str>,
        sid: &str,
    ) -> NexumResult<()> {
        let Some(me) = self.me.upgrade() else {
            return Err(SessionError::Closed.into());
        };
        let owner: Arc<dyn Session> = me;
        let sub = self.server.registry().subscribe(
            &owner,
            SubscribeRequest {
                subject,
                queue,
                sid,
                remote: None,
            },
        )?;
        self.server.announce_sub(&sub);
        self.ack();
        Ok(())
    }

    fn on_unsub(
        &self,
        sid: &str,
        max: Option<u64>,
    ) -> NexumResult<()> {
        let registry = self.server.registry();
        let removed = match max {
            Some(max) => registry.auto_unsubscribe(self.core.id, sid, max)?,
            None => Some(registry.unsubscribe(self.core.id, sid)?),
        };
        if let Some(sub) = removed {
            self.server.announce_unsub(&sub);
        }
        self.ack();
        Ok(())
    }

    /// Сообщает ошибку клиенту; возвращает `false`, если сессия закрыта.
    fn fail(
        &self,
        err: StackError,
    ) -> bool {
        log_error(self.core.id, SessionKind::Client, &err);
        self.enqueue(&err_line(&err.client_message()));
        if err.is_fatal(self.pedantic()) {
            self.close(close_reason_for(err.status_code()));
            return false;
        }
        true
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Session for ClientSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Client
    }

    fn close(
        &self,
        reason: CloseReason,
    ) {
        if !self.core.begin_close(reason) {
            return;
        }
        debug!(cid = self.core.id, ?reason, "closing client");
        self.server.remove_client(self.core.id);
    }

    fn deliver(
        &self,
        sub: &Subscription,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> bool {
        let pushed = self
            .core
            .outbound
            .push_msg(|buf| write_msg(buf, subject, &sub.sid, reply, payload));
        match pushed {
            Ok(()) => {
                self.core.stats.record_out(payload.len());
                true
            }
            Err(OutboundError::Closed) => false,
            Err(e) => {
                self.server.evict_slow_consumer(self, &e.to_string());
                false
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
    ) {
        let opts = self.server.opts().clone();
        let mut parser = Parser::new(opts.max_control_line, opts.max_payload);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closed = self.core.closed_signal();

        let auth_deadline = sleep(opts.auth_timeout);
        tokio::pin!(auth_deadline);
        let mut ping = interval_at(Instant::now() + opts.ping_interval, opts.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = self.is_connected();
            select! {
                _ = wait_closed(&mut closed) => break,
                _ = &mut auth_deadline, if !connected => {
                    let err = SessionError::AuthTimeout {
                        timeout_ms: opts.auth_timeout.as_millis() as u64,
                    };
                    self.fail(err.into());
                    break;
                }
                _ = ping.tick(), if connected => {
                    if self.core.heartbeat(opts.max_pings_out) == Heartbeat::Stale {
                        let err = SessionError::StaleConnection {
                            pings_out: self.core.pings_out(),
                        };
                        self.fail(err.into());
                        break;
                    }
                    self.enqueue(PING);
                }
                res = reader.read_buf(&mut buf) => match res {
                    Ok(0) => {
                        self.close(CloseReason::ClientClosed);
                        break;
                    }
                    Ok(_) => {
                        self.core.touch();
                        if !self.process_buffer(&mut parser, &mut buf) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(cid = self.core.id, error = %e, "client read failed");
                        self.close(CloseReason::ReadError);
                        break;
                    }
                },
            }
        }
        if !self.core.is_closed() {
            warn!(cid = self.core.id, "read loop ended without close");
        }
    }

    fn name(&self) -> Option<String> {
        self.flags.lock().name.clone()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let flags = self.flags.lock();
        f.debug_struct("ClientSession")
            .field("cid", &self.core.id)
            .field("addr", &self.core.addr)
            .field("state", &self.core.state.get())
            .field("verbose", &flags.verbose)
            .field("pedantic", &flags.pedantic)
            .field("lang", &flags.lang)
            .field("version", &flags.version)
            .finish()
    }
}
