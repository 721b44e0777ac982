use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nexum_error::{NexumResult, ProtocolError, RouteError, SessionError, StackError};
use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt,
    net::tcp::OwnedReadHalf,
    select,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    auth::Credentials,
    config::RouteUrl,
    protocol::{
        err_line, json_line, parse_json, sync_line, write_rmsg, Op, Parser, RouteConnect,
        RouteInfo, RoutedMessage, PING, PONG,
    },
    registry::Subscription,
    server::{close_reason_for, log_error, Server},
    session::{
        wait_closed, CloseReason, ConnectionState, Heartbeat, OutboundError, Session, SessionCore,
        SessionKind, READ_BUFFER_SIZE,
    },
};

/// Текст `-ERR`, которым сервер отклоняет дублирующий маршрут.
pub(crate) const DUPLICATE_ROUTE: &str = "Duplicate Route";

/// Соединение с другим сервером кластера.
pub struct RouteSession {
    core: SessionCore,
    server: Arc<Server>,
    me: Weak<RouteSession>,
    /// Соединение инициировано этим сервером.
    solicited: bool,
    url: Option<RouteUrl>,
    remote_id: OnceLock<Arc<str>>,
    remote_info: Mutex<Option<RouteInfo>>,
    connect_seen: AtomicBool,
    established: AtomicBool,
    /// Упорядочивает полную синхронизацию интереса и инкрементальные
    /// `RS+`/`RS-`: анонс не может попасть в буфер раньше снимка.
    interest_order: Mutex<()>,
}

impl RouteSession {
    pub(crate) fn new(
        server: Arc<Server>,
        id: u64,
        addr: SocketAddr,
        url: Option<RouteUrl>,
    ) -> Arc<Self> {
        let opts = server.opts();
        let core = SessionCore::new(
            id,
            addr,
            opts.max_pending_bytes,
            opts.max_pending_msgs,
            opts.write_deadline,
        );
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            solicited: url.is_some(),
            url,
            server,
            remote_id: OnceLock::new(),
            remote_info: Mutex::new(None),
            connect_seen: AtomicBool::new(false),
            established: AtomicBool::new(false),
            interest_order: Mutex::new(()),
        })
    }

    pub fn is_solicited(&self) -> bool {
        self.solicited
    }

    /// Рукопожатие завершено и маршрут зарегистрирован.
    pub fn is_connected(&self) -> bool {
        self.core.state.get() == ConnectionState::Connected
    }

    /// Маршрут хотя бы раз был установлен.
    pub fn was_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Идентификатор удалённого сервера, если рукопожатие дошло до INFO.
    pub fn remote_id(&self) -> Option<Arc<str>> {
        self.remote_id.get().cloned()
    }

    pub fn remote_info(&self) -> Option<RouteInfo> {
        self.remote_info.lock().clone()
    }

    /// Первые строки рукопожатия: инициатор представляется через
    /// `CONNECT`, затем обе стороны шлют `INFO`.
    pub(crate) fn start_handshake(&self) {
        if self.solicited {
            let opts = self.server.opts();
            let (user, pass) = match &self.url {
                Some(url) if url.user.is_some() => (url.user.clone(), url.pass.clone()),
                _ => (opts.cluster_username.clone(), opts.cluster_password.clone()),
            };
            let connect = RouteConnect {
                user,
                pass,
                name: Some(self.server.id().to_string()),
            };
            self.enqueue(&json_line("CONNECT", &connect));
        }
        self.enqueue(&self.server.route_info_line());
    }

    /// Ставит строку в очередь; переполнение выселяет маршрут.
    pub(crate) fn enqueue(
        &self,
        data: &[u8],
    ) {
        let pushed = {
            let _order = self.interest_order.lock();
            self.core.send(data)
        };
        self.on_pushed(pushed);
    }

    /// Ставит в очередь `SYNC n` и снимок интереса одним блоком.
    ///
    /// Снимок снимается под той же блокировкой, что и [`Self::enqueue`],
    /// поэтому параллельный `RS-` окажется в буфере после снимка.
    pub(crate) fn enqueue_interest_sync<F>(
        &self,
        snapshot: F,
    ) where
        F: FnOnce() -> Vec<Bytes>,
    {
        let pushed = {
            let _order = self.interest_order.lock();
            let lines = snapshot();
            debug!(rid = self.core.id, count = lines.len(), "sending interest sync");
            std::iter::once(sync_line(lines.len()))
                .chain(lines)
                .try_for_each(|line| self.core.send(&line))
        };
        self.on_pushed(pushed);
    }

    fn on_pushed(
        &self,
        pushed: Result<(), OutboundError>,
    ) {
        match pushed {
            Ok(()) | Err(OutboundError::Closed) => {}
            Err(e) => self.server.evict_slow_consumer(self, &e.to_string()),
        }
    }

    /// Ставит в очередь пересылаемое сообщение.
    pub(crate) fn send_rmsg(
        &self,
        msg: &RoutedMessage,
    ) {
        match self.core.outbound.push_msg(|buf| write_rmsg(buf, msg)) {
            Ok(()) => self.core.stats.record_out(msg.payload.len()),
            Err(e) => {
                if !self.core.is_closed() {
                    self.server.evict_slow_consumer(self, &e.to_string());
                }
            }
        }
    }

    fn handshake_done(&self) -> bool {
        self.core.state.get() == ConnectionState::Connected
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
            trace!(rid = self.core.id, op = %op, "<- route");
            if let Err(e) = self.process_op(op) {
                self.fail(e);
                return !self.core.is_closed();
            }
        }
    }

    fn process_op(
        &self,
        op: Op,
    ) -> NexumResult<()> {
        match op {
            Op::Ping => {
                self.enqueue(PONG);
                Ok(())
            }
            Op::Pong => {
                self.core.pong_received();
                Ok(())
            }
            Op::Ok => Ok(()),
            Op::Err(message) => {
                self.on_remote_error(&message);
                Ok(())
            }
            Op::Connect(raw) => self.on_connect(&raw),
            Op::Info(raw) => self.on_info(&raw),
            op if !self.handshake_done() => Err(ProtocolError::NotAllowed {
                op: op.name().to_string(),
            }
            .into()),
            Op::Sync(count) => {
                debug!(rid = self.core.id, count, "receiving interest sync");
                Ok(())
            }
            Op::RsPlus {
                origin,
                rsid,
                subject,
                queue,
            } => {
                if let Some(me) = self.me.upgrade() {
                    self.server
                        .route_subscribe(&me, &origin, &rsid, &subject, queue.as_deref());
                }
                Ok(())
            }
            Op::RsMinus { origin, rsid } => {
                self.server.route_unsubscribe(self.core.id, &origin, &rsid);
                Ok(())
            }
            Op::Rmsg(msg) => {
                self.core.stats.record_in(msg.payload.len());
                self.server.route_publish(self, &msg);
                Ok(())
            }
            Op::Oversized { op, size } => {
                warn!(rid = self.core.id, op, size, "dropping oversized routed message");
                Ok(())
            }
            other => Err(ProtocolError::NotAllowed {
                op: other.name().to_string(),
            }
            .into()),
        }
    }

    fn on_connect(
        &self,
        raw: &str,
    ) -> NexumResult<()> {
        let connect: RouteConnect = parse_json("CONNECT", raw)?;
        if self.solicited {
            debug!(rid = self.core.id, "ignoring CONNECT on solicited route");
            return Ok(());
        }
        self.server.route_auth().check(Credentials {
            user: connect.user.as_deref(),
            pass: connect.pass.as_deref(),
            token: None,
        })?;
        self.connect_seen.store(true, Ordering::Release);
        Ok(())
    }

    fn on_info(
        &self,
        raw: &str,
    ) -> NexumResult<()> {
        let info: RouteInfo = parse_json("INFO", raw)?;

        if self.handshake_done() {
            trace!(rid = self.core.id, "route info update");
            *self.remote_info.lock() = Some(info);
            return Ok(());
        }

        if !self.solicited
            && self.server.route_auth().required()
            && !self.connect_seen.load(Ordering::Acquire)
        {
            return Err(SessionError::AuthorizationViolation.into());
        }

        let remote: Arc<str> = Arc::from(info.server_id.as_str());
        if remote == *self.server.id() {
            info!(rid = self.core.id, "route points to this server, closing");
            self.close(CloseReason::SelfRoute);
            return Ok(());
        }
        if self.remote_id.set(remote.clone()).is_err() {
            return Err(RouteError::HandshakeFailed {
                reason: "remote server id changed".into(),
            }
            .into());
        }
        *self.remote_info.lock() = Some(info);
        self.core.state.set(ConnectionState::Authenticating);

        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        self.server.register_route(&me, &remote)?;

        self.established.store(true, Ordering::Release);
        self.core.state.set(ConnectionState::Connected);
        info!(
            rid = self.core.id,
            remote = %remote,
            addr = %self.core.addr,
            solicited = self.solicited,
            "route established"
        );
        self.server.sync_interest(self);
        Ok(())
    }

    fn on_remote_error(
        &self,
        message: &str,
    ) {
        if message == DUPLICATE_ROUTE {
            info!(rid = self.core.id, "remote rejected duplicate route");
            self.close(CloseReason::DuplicateRoute);
        } else {
            warn!(rid = self.core.id, error = message, "route reported error");
        }
    }

    fn fail(
        &self,
        err: StackError,
    ) {
        log_error(self.core.id, SessionKind::Route, &err);
        self.enqueue(&err_line(&err.client_message()));
        // Маршруты всегда работают в строгом режиме.
        if err.is_fatal(true) {
            self.close(close_reason_for(err.status_code()));
        }
    }
}

#[async_trait]
impl Session for RouteSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Route
    }

    fn close(
        &self,
        reason: CloseReason,
    ) {
        if !self.core.begin_close(reason) {
            return;
        }
        debug!(rid = self.core.id, remote = ?self.remote_id(), ?reason, "closing route");
        self.server.remove_route(self);
    }

    /// Подписки маршрута обслуживаются пересылкой `RMSG`, а не `MSG`.
    fn deliver(
        &self,
        sub: &Subscription,
        _subject: &str,
        _reply: Option<&str>,
        _payload: &Bytes,
    ) -> bool {
        trace!(rid = self.core.id, sid = %sub.sid, "direct delivery to route ignored");
        false
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
    ) {
        let opts = self.server.opts().clone();
        let mut parser = Parser::new(opts.max_control_line, opts.max_payload);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closed = self.core.closed_signal();

        let handshake_deadline = sleep(opts.route_handshake_timeout);
        tokio::pin!(handshake_deadline);
        let mut ping = interval_at(Instant::now() + opts.ping_interval, opts.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = self.handshake_done();
            select! {
                _ = wait_closed(&mut closed) => break,
                _ = &mut handshake_deadline, if !connected => {
                    warn!(
                        rid = self.core.id,
                        timeout_ms = opts.route_handshake_timeout.as_millis() as u64,
                        "route handshake timed out"
                    );
                    self.close(CloseReason::RouteHandshake);
                    break;
                }
                _ = ping.tick(), if connected => {
                    if self.core.heartbeat(opts.max_pings_out) == Heartbeat::Stale {
                        let err = SessionError::StaleConnection { pings_out: self.core.pings_out() };
                        warn!(rid = self.core.id, error = %err, "route is stale");
                        self.close(CloseReason::StaleConnection);
                        break;
                    }
                    self.enqueue(PING);
                }
                res = reader.read_buf(&mut buf) => match res {
                    Ok(0) => {
                        debug!(rid = self.core.id, "route closed by peer");
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
                        debug!(rid = self.core.id, error = %e, "route read failed");
                        self.close(CloseReason::ReadError);
                        break;
                    }
                },
            }
        }
    }

    fn remote_server_id(&self) -> Option<Arc<str>> {
        self.remote_id()
    }

    fn name(&self) -> Option<String> {
        self.url.as_ref().map(|u| u.to_string())
    }
}
