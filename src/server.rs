//! Ядро брокера.
//!
//! [`Server`] владеет реестром подписок и всеми живыми сессиями, принимает
//! соединения клиентов и маршрутов, раздаёт сообщения подписчикам и
//! пересылает их в кластер.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use nexum_error::{
    ErrorExt, LogLevel, NetworkError, NexumResult, RouteError, SessionError, StackError,
    StatusCode, SubscriptionError,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    time::sleep,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    auth::Authenticator,
    client::ClientSession,
    config::{remove_self_references, Options, RouteUrl},
    protocol::{
        err_line, json_line, rs_minus_line, rs_plus_line, RouteInfo, RoutedMessage, ServerInfo,
    },
    registry::{Delivery, Registry, RemoteInterest, SubscribeRequest, Subscription},
    route::{cluster::interest_key, dialer, session::DUPLICATE_ROUTE, Cluster, RouteSession},
    session::{wait_closed, CloseReason, Session, SessionKind},
    stats::{Connz, ServerStats, Varz},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Пауза после ошибки `accept`, чтобы не крутить цикл впустую.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Ядро брокера. Создаётся один раз и передаётся сессиям через `Arc`.
pub struct Server {
    opts: Options,
    id: Arc<str>,
    registry: Registry,
    sessions: DashMap<u64, Arc<dyn Session>>,
    routes: DashMap<u64, Arc<RouteSession>>,
    /// server_id удалённого сервера → id зарегистрированного маршрута.
    remotes: DashMap<Arc<str>, u64>,
    cluster: Cluster,
    client_auth: Authenticator,
    route_auth: Authenticator,
    stats: ServerStats,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    client_addr: OnceLock<SocketAddr>,
    cluster_addr: OnceLock<SocketAddr>,
    started: Instant,
}

/// Итог работы маршрута для дозвона.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub reason: Option<CloseReason>,
    pub remote_id: Option<Arc<str>>,
    pub established: bool,
}

/// План пересылки одного сообщения по маршрутам.
#[derive(Default)]
struct ForwardPlan {
    targets: Vec<ForwardTarget>,
}

struct ForwardTarget {
    route: Arc<RouteSession>,
    remote_id: Arc<str>,
    queues: Vec<Arc<str>>,
}

impl ForwardPlan {
    fn add(
        &mut self,
        route: Arc<RouteSession>,
        remote_id: Arc<str>,
        queue: Option<&Arc<str>>,
    ) {
        let idx = match self.targets.iter().position(|t| t.route.id() == route.id()) {
            Some(idx) => idx,
            None => {
                self.targets.push(ForwardTarget {
                    route,
                    remote_id,
                    queues: Vec::new(),
                });
                self.targets.len() - 1
            }
        };
        if let Some(queue) = queue {
            self.targets[idx].queues.push(queue.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Откуда пришло сообщение, которое раздаёт ядро.
#[derive(Clone, Copy)]
struct Source<'a> {
    route_id: Option<u64>,
    routed: Option<&'a RoutedMessage>,
}

impl Source<'_> {
    const LOCAL: Source<'static> = Source {
        route_id: None,
        routed: None,
    };

    fn visited(
        &self,
        server_id: &str,
    ) -> bool {
        self.routed.map(|m| m.visited(server_id)).unwrap_or(false)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Server {
    /// Проверяет конфигурацию и создаёт ядро брокера.
    pub fn new(opts: Options) -> NexumResult<Arc<Self>> {
        opts.validate()?;

        let client_auth = Authenticator::new(
            opts.username.clone(),
            opts.password.clone(),
            opts.authorization.clone(),
        );
        let route_auth = Authenticator::new(
            opts.cluster_username.clone(),
            opts.cluster_password.clone(),
            None,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id: Arc::from(Uuid::new_v4().simple().to_string().to_uppercase()),
            opts,
            registry: Registry::new(),
            sessions: DashMap::new(),
            routes: DashMap::new(),
            remotes: DashMap::new(),
            cluster: Cluster::new(),
            client_auth,
            route_auth,
            stats: ServerStats::new(),
            next_id: AtomicU64::new(1),
            shutdown_tx,
            client_addr: OnceLock::new(),
            cluster_addr: OnceLock::new(),
            started: Instant::now(),
        }))
    }

    /// Поднимает слушателей и запускает дозвон маршрутов.
    ///
    /// Ошибка привязки сокета возвращается вызывающему.
    pub async fn start(self: &Arc<Self>) -> NexumResult<()> {
        let client_addr = self.opts.client_listen_addr();
        let listener = bind(&client_addr).await?;
        let local = listener.local_addr()?;
        let _ = self.client_addr.set(local);
        info!(server_id = %self.id, addr = %local, "listening for client connections");
        tokio::spawn(self.clone().accept_clients(listener));

        let Some(cluster_addr) = self.opts.cluster_listen_addr() else {
            return Ok(());
        };
        let listener = bind(&cluster_addr).await?;
        let local = listener.local_addr()?;
        let _ = self.cluster_addr.set(local);
        info!(server_id = %self.id, addr = %local, "listening for route connections");
        tokio::spawn(self.clone().accept_routes(listener));

        let urls = remove_self_references(self.opts.route_urls()?, local).await;
        for url in urls {
            info!(url = %url, "soliciting route");
            tokio::spawn(dialer::run(self.clone(), url));
        }
        Ok(())
    }

    /// Закрывает слушателей и все сессии. Повторный вызов ничего не делает.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(server_id = %self.id, "server shutting down");

        let sessions: Vec<Arc<dyn Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.close(CloseReason::ServerShutdown);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn client_auth(&self) -> &Authenticator {
        &self.client_auth
    }

    pub fn route_auth(&self) -> &Authenticator {
        &self.route_auth
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr.get().copied()
    }

    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_addr.get().copied()
    }

    /// Количество установленных маршрутов.
    pub fn num_routes(&self) -> usize {
        self.remotes.len()
    }

    pub fn num_clients(&self) -> usize {
        self.stats.connections()
    }

    /// Есть ли установленный маршрут к серверу.
    pub fn is_route_connected(
        &self,
        server_id: &str,
    ) -> bool {
        self.remotes.contains_key(server_id)
    }

    /// Общая статистика сервера.
    pub fn varz(&self) -> Varz {
        let s = &self.stats;
        Varz {
            server_id: self.id.to_string(),
            version: VERSION.to_string(),
            host: self.opts.host.clone(),
            port: self.client_addr().map(|a| a.port()).unwrap_or(self.opts.port),
            cluster_port: self.cluster_addr().map(|a| a.port()),
            max_payload: self.opts.max_payload,
            uptime_secs: self.started.elapsed().as_secs(),
            connections: s.connections(),
            total_connections: s.total_connections.load(Ordering::Relaxed),
            routes: s.routes(),
            in_msgs: s.in_msgs.load(Ordering::Relaxed),
            in_bytes: s.in_bytes.load(Ordering::Relaxed),
            out_msgs: s.out_msgs.load(Ordering::Relaxed),
            out_bytes: s.out_bytes.load(Ordering::Relaxed),
            slow_consumers: s.slow_consumers(),
            rejected_connections: s.rejected_connections.load(Ordering::Relaxed),
            subscriptions: self.registry.count(),
            sublist: self.registry.stats(),
        }
    }

    /// Снимки всех сессий, упорядоченные по id.
    pub fn connz(&self) -> Connz {
        let sessions: Vec<Arc<dyn Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut connections: Vec<_> = sessions
            .iter()
            .map(|s| s.snapshot(self.registry.session_count(s.id())))
            .collect();
        connections.sort_by_key(|c| c.id);

        Connz {
            num_connections: connections
                .iter()
                .filter(|c| c.kind == SessionKind::Client)
                .count(),
            num_routes: connections
                .iter()
                .filter(|c| c.kind == SessionKind::Route)
                .count(),
            connections,
        }
    }

    /// Строка `INFO` для нового клиента.
    pub(crate) fn client_info_line(&self) -> Bytes {
        json_line(
            "INFO",
            &ServerInfo {
                server_id: self.id.to_string(),
                host: self.opts.host.clone(),
                port: self.client_addr().map(|a| a.port()).unwrap_or(self.opts.port),
                version: VERSION.to_string(),
                auth_required: self.client_auth.required(),
                ssl_required: false,
                max_payload: self.opts.max_payload,
            },
        )
    }

    /// Строка `INFO` для маршрута.
    pub(crate) fn route_info_line(&self) -> Bytes {
        json_line(
            "INFO",
            &RouteInfo {
                server_id: self.id.to_string(),
                host: self.opts.cluster_host.clone(),
                port: self.client_addr().map(|a| a.port()).unwrap_or(self.opts.port),
                cluster_port: self.cluster_addr().map(|a| a.port()).unwrap_or(0),
                version: VERSION.to_string(),
                auth_required: self.route_auth.required(),
                max_payload: self.opts.max_payload,
                routes: self.opts.routes.clone(),
            },
        )
    }

    fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Приём соединений
    ////////////////////////////////////////////////////////////////////////////

    async fn accept_clients(
        self: Arc<Self>,
        listener: TcpListener,
    ) {
        let mut shutdown = self.shutdown_signal();
        loop {
            select! {
                _ = wait_closed(&mut shutdown) => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => self.accept_client(stream, addr),
                    Err(e) => {
                        warn!(error = %e, "failed to accept client connection");
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        debug!("client listener stopped");
    }

    fn accept_client(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        let _ = stream.set_nodelay(true);

        if self.stats.connections() >= self.opts.max_connections {
            self.stats.rejected();
            let err = SessionError::TooManyConnections {
                max: self.opts.max_connections,
            };
            warn!(addr = %addr, max = self.opts.max_connections, "maximum connections exceeded");
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(&err_line(&err.client_message())).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        let cid = self.next_session_id();
        let client = ClientSession::new(self.clone(), cid, addr);
        self.stats.connection_opened();
        self.sessions.insert(cid, client.clone());
        debug!(cid, addr = %addr, "client connection created");

        client.send_info();
        tokio::spawn(self.clone().run_session(client, stream));
    }

    async fn accept_routes(
        self: Arc<Self>,
        listener: TcpListener,
    ) {
        let mut shutdown = self.shutdown_signal();
        loop {
            select! {
                _ = wait_closed(&mut shutdown) => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "route connection accepted");
                        tokio::spawn(self.clone().run_route(stream, addr, None));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept route connection");
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        debug!("route listener stopped");
    }

    /// Ведёт маршрут от рукопожатия до закрытия.
    pub(crate) async fn run_route(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        url: Option<RouteUrl>,
    ) -> RouteOutcome {
        let _ = stream.set_nodelay(true);
        let rid = self.next_session_id();
        let route = RouteSession::new(self.clone(), rid, addr, url);
        self.sessions.insert(rid, route.clone());
        self.routes.insert(rid, route.clone());

        route.start_handshake();
        self.clone().run_session(route.clone(), stream).await;

        RouteOutcome {
            reason: route.core().close_reason(),
            remote_id: route.remote_id(),
            established: route.was_established(),
        }
    }

    /// Запускает запись в отдельной задаче и читает до закрытия сессии.
    async fn run_session(
        self: Arc<Self>,
        session: Arc<dyn Session>,
        stream: TcpStream,
    ) {
        if self.is_shutting_down() {
            session.close(CloseReason::ServerShutdown);
        }

        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(session.clone().write_loop(writer));

        session.clone().read_loop(reader).await;
        session.close(CloseReason::ClientClosed);

        if let Err(e) = writer_task.await {
            error!(id = session.id(), error = %e, "writer task failed");
        }
        session.core().finish_close();
        debug!(
            id = session.id(),
            kind = %session.kind(),
            reason = ?session.core().close_reason(),
            "session closed"
        );
    }

    ////////////////////////////////////////////////////////////////////////////
    // Жизненный цикл сессий
    ////////////////////////////////////////////////////////////////////////////

    /// Очистка после закрытия клиента.
    pub(crate) fn remove_client(
        &self,
        cid: u64,
    ) {
        if self.sessions.remove(&cid).is_some() {
            self.stats.connection_closed();
        }
        for sub in self.registry.unsubscribe_all(cid) {
            self.announce_unsub(&sub);
        }
    }

    /// Регистрирует маршрут после рукопожатия.
    ///
    /// Из двух соединений с одним сервером остаётся то, которое
    /// инициировал сервер с меньшим id; проигравшее закрывается.
    pub(crate) fn register_route(
        &self,
        route: &Arc<RouteSession>,
        remote_id: &Arc<str>,
    ) -> Result<(), RouteError> {
        let preferred_soliciter = std::cmp::min(&self.id, remote_id).clone();
        let soliciter = |r: &RouteSession| -> Arc<str> {
            if r.is_solicited() {
                self.id.clone()
            } else {
                remote_id.clone()
            }
        };

        let displaced = match self.remotes.entry(remote_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(route.id());
                None
            }
            Entry::Occupied(mut slot) => {
                let existing = self.routes.get(slot.get()).map(|r| r.value().clone());
                match existing {
                    Some(existing) if !existing.is_closed() => {
                        let new_wins = soliciter(&**route) == preferred_soliciter
                            && (soliciter(&*existing) != preferred_soliciter
                                || route.id() > existing.id());
                        if !new_wins {
                            return Err(RouteError::DuplicateRoute {
                                server_id: remote_id.to_string(),
                            });
                        }
                        slot.insert(route.id());
                        Some(existing)
                    }
                    _ => {
                        slot.insert(route.id());
                        None
                    }
                }
            }
        };

        if let Some(old) = displaced {
            info!(remote = %remote_id, old = old.id(), new = route.id(), "replacing duplicate route");
            old.enqueue(&err_line(DUPLICATE_ROUTE));
            old.close(CloseReason::DuplicateRoute);
        }
        self.stats.route_opened();
        Ok(())
    }

    /// Очистка после закрытия маршрута: снимается весь интерес,
    /// полученный через него.
    ///
    /// Если это был прямой маршрут к серверу, вместе с ним снимается и
    /// интерес этого сервера, пересказанный другими маршрутами.
    pub(crate) fn remove_route(
        &self,
        route: &RouteSession,
    ) {
        let rid = route.id();
        self.sessions.remove(&rid);
        self.routes.remove(&rid);

        let mut lost_server = None;
        if let Some(remote) = route.remote_id() {
            if self.remotes.remove_if(&remote, |_, id| *id == rid).is_some() {
                self.stats.route_closed();
                info!(remote = %remote, rid, "route removed");
                lost_server = Some(remote);
            }
        }

        let mut released = self.registry.unsubscribe_all(rid);
        if let Some(origin) = &lost_server {
            let relayed = self.registry.unsubscribe_origin(origin);
            debug!(remote = %origin, count = relayed.len(), "purging relayed interest");
            released.extend(relayed);
        }
        for sub in released {
            self.release_interest(&sub, rid);
        }
    }

    /// Медленный потребитель выселяется без блокировки издателя.
    pub(crate) fn evict_slow_consumer(
        &self,
        session: &dyn Session,
        reason: &str,
    ) {
        if session.is_closed() {
            return;
        }
        self.stats.slow_consumer();
        let err = SessionError::SlowConsumer {
            reason: reason.to_string(),
        };
        warn!(id = session.id(), kind = %session.kind(), error = %err, "slow consumer detected");
        session.close(CloseReason::SlowConsumer);
    }

    ////////////////////////////////////////////////////////////////////////////
    // Распространение интереса
    ////////////////////////////////////////////////////////////////////////////

    /// Снимок установленных маршрутов.
    fn connected_routes(&self) -> Vec<Arc<RouteSession>> {
        self.routes
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.value().clone())
            .collect()
    }

    fn broadcast_routes<F>(
        &self,
        line: &[u8],
        skip: F,
    ) where
        F: Fn(&RouteSession) -> bool,
    {
        for route in self.connected_routes() {
            if !skip(&route) {
                route.enqueue(line);
            }
        }
    }

    /// `RS+` для новой подписки клиента.
    pub(crate) fn announce_sub(
        &self,
        sub: &Subscription,
    ) {
        if sub.kind != SessionKind::Client {
            return;
        }
        let line = rs_plus_line(&self.id, &sub.route_sid(), &sub.subject, sub.queue.as_deref());
        self.broadcast_routes(&line, |_| false);
    }

    /// `RS-` для снятой подписки клиента.
    pub(crate) fn announce_unsub(
        &self,
        sub: &Subscription,
    ) {
        if sub.kind != SessionKind::Client {
            return;
        }
        let line = rs_minus_line(&self.id, &sub.route_sid());
        self.broadcast_routes(&line, |_| false);
    }

    /// `RS+`, полученный с маршрута.
    pub(crate) fn route_subscribe(
        &self,
        route: &Arc<RouteSession>,
        origin: &str,
        rsid: &str,
        subject: &str,
        queue: Option<&str>,
    ) {
        if origin == &*self.id {
            trace!(rid = route.id(), rsid, "ignoring own interest echoed back");
            return;
        }

        let key = interest_key(origin, rsid);
        let owner: Arc<dyn Session> = route.clone();
        let req = SubscribeRequest {
            subject,
            queue,
            sid: &key,
            remote: Some(RemoteInterest {
                origin: Arc::from(origin),
                rsid: Arc::from(rsid),
            }),
        };
        match self.registry.subscribe(&owner, req) {
            Ok(_) => {}
            Err(SubscriptionError::DuplicateSid { .. }) => return,
            Err(e) => {
                warn!(rid = route.id(), origin, subject, error = %e, "rejecting remote interest");
                return;
            }
        }

        if self.cluster.acquire(&key) {
            let line = rs_plus_line(origin, rsid, subject, queue);
            self.broadcast_routes(&line, |r| {
                r.id() == route.id() || r.remote_id().as_deref() == Some(origin)
            });
        }
    }

    /// `RS-`, полученный с маршрута.
    pub(crate) fn route_unsubscribe(
        &self,
        rid: u64,
        origin: &str,
        rsid: &str,
    ) {
        let key = interest_key(origin, rsid);
        if let Ok(sub) = self.registry.unsubscribe(rid, &key) {
            self.release_interest(&sub, rid);
        }
    }

    fn release_interest(
        &self,
        sub: &Subscription,
        rid: u64,
    ) {
        let Some(interest) = &sub.remote else {
            return;
        };
        if self.cluster.release(&sub.sid) {
            let line = rs_minus_line(&interest.origin, &interest.rsid);
            self.broadcast_routes(&line, |r| {
                r.id() == rid || r.remote_id().as_ref() == Some(&interest.origin)
            });
        }
    }

    /// Полная синхронизация интереса для нового маршрута.
    ///
    /// Маршрут уже помечен установленным, поэтому изменения после снимка
    /// придут инкрементально следом за ним.
    pub(crate) fn sync_interest(
        &self,
        route: &RouteSession,
    ) {
        let remote = route.remote_id();
        route.enqueue_interest_sync(|| {
            let mut seen: HashSet<Arc<str>> = HashSet::new();
            let mut lines = Vec::new();
            self.registry.for_each(|sub| match (sub.kind, &sub.remote) {
                (SessionKind::Client, _) => lines.push(rs_plus_line(
                    &self.id,
                    &sub.route_sid(),
                    &sub.subject,
                    sub.queue.as_deref(),
                )),
                (SessionKind::Route, Some(interest)) => {
                    if sub.session_id == route.id() || remote.as_ref() == Some(&interest.origin) {
                        return;
                    }
                    if seen.insert(sub.sid.clone()) {
                        lines.push(rs_plus_line(
                            &interest.origin,
                            &interest.rsid,
                            &sub.subject,
                            sub.queue.as_deref(),
                        ));
                    }
                }
                (SessionKind::Route, None) => {}
            });
            lines
        });
    }

    ////////////////////////////////////////////////////////////////////////////
    // Раздача сообщений
    ////////////////////////////////////////////////////////////////////////////

    /// Раздаёт сообщение, опубликованное локальным клиентом.
    pub fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) {
        self.stats.record_in(payload.len());

        let result = self.registry.match_subject(subject);
        if result.is_empty() {
            return;
        }

        let mut plan = ForwardPlan::default();
        for sub in &result.plain {
            self.dispatch(sub, None, Source::LOCAL, subject, reply, payload, &mut plan);
        }
        for group in &result.queues {
            let picked = self
                .registry
                .pick_queue_member(group, |s| self.is_eligible(s, Source::LOCAL));
            if let Some(sub) = picked {
                self.dispatch(&sub, Some(&group.name), Source::LOCAL, subject, reply, payload, &mut plan);
            }
        }

        if !plan.is_empty() {
            let seq = self.cluster.next_seq();
            self.forward(plan, &self.id, seq, &[], subject, reply, payload);
        }
    }

    /// Раздаёт сообщение, пришедшее с маршрута.
    ///
    /// Повторно пришедшая копия не доставляется обычным подписчикам, но
    /// группы очередей из её списка всё равно обслуживаются.
    pub(crate) fn route_publish(
        &self,
        route: &RouteSession,
        msg: &RoutedMessage,
    ) {
        if msg.origin == self.id {
            trace!(rid = route.id(), seq = msg.seq, "dropping own message");
            return;
        }
        self.stats.record_in(msg.payload.len());

        let fresh = self.cluster.mark_seen(&msg.origin, msg.seq);
        let result = self.registry.match_subject(&msg.subject);
        let source = Source {
            route_id: Some(route.id()),
            routed: Some(msg),
        };
        let reply = msg.reply.as_deref();

        let mut plan = ForwardPlan::default();
        if fresh {
            for sub in &result.plain {
                self.dispatch(sub, None, source, &msg.subject, reply, &msg.payload, &mut plan);
            }
        } else {
            trace!(origin = %msg.origin, seq = msg.seq, "duplicate routed message");
        }

        for name in &msg.queues {
            let Some(group) = result.queues.iter().find(|g| g.name == *name) else {
                trace!(queue = %name, subject = %msg.subject, "no members left for queue group");
                continue;
            };
            let picked = self
                .registry
                .pick_queue_member(group, |s| self.is_eligible(s, source));
            if let Some(sub) = picked {
                self.dispatch(&sub, Some(&group.name), source, &msg.subject, reply, &msg.payload, &mut plan);
            }
        }

        if !plan.is_empty() {
            self.forward(plan, &msg.origin, msg.seq, &msg.path, &msg.subject, reply, &msg.payload);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        sub: &Arc<Subscription>,
        queue: Option<&Arc<str>>,
        source: Source<'_>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
        plan: &mut ForwardPlan,
    ) {
        match sub.kind {
            SessionKind::Client => self.deliver_local(sub, subject, reply, payload),
            SessionKind::Route => {
                if let Some((route, remote)) = self.route_target(sub, source) {
                    plan.add(route, remote, queue);
                }
            }
        }
    }

    fn deliver_local(
        &self,
        sub: &Arc<Subscription>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) {
        let Some(owner) = sub.owner() else {
            return;
        };
        let delivery = sub.record_delivery();
        if delivery == Delivery::Expired {
            return;
        }
        if owner.deliver(sub, subject, reply, payload) {
            self.stats.record_out(payload.len());
        }
        if delivery == Delivery::Last && self.registry.remove(sub) {
            debug!(cid = sub.session_id, sid = %sub.sid, "auto-unsubscribe limit reached");
            self.announce_unsub(sub);
        }
    }

    fn is_eligible(
        &self,
        sub: &Subscription,
        source: Source<'_>,
    ) -> bool {
        match sub.kind {
            SessionKind::Client => sub.owner().map(|o| !o.is_closed()).unwrap_or(false),
            SessionKind::Route => self.route_target(sub, source).is_some(),
        }
    }

    /// Маршрут, через который нужно переслать сообщение для подписки.
    ///
    /// Копия интереса, полученная транзитом, не используется, если есть
    /// прямой маршрут к серверу-источнику подписки.
    fn route_target(
        &self,
        sub: &Subscription,
        source: Source<'_>,
    ) -> Option<(Arc<RouteSession>, Arc<str>)> {
        if source.route_id == Some(sub.session_id) {
            return None;
        }
        let route = self.routes.get(&sub.session_id).map(|r| r.value().clone())?;
        if !route.is_connected() {
            return None;
        }
        let remote = route.remote_id()?;
        if source.visited(&remote) {
            return None;
        }
        if let Some(interest) = &sub.remote {
            if interest.origin != remote && self.remotes.contains_key(&interest.origin) {
                return None;
            }
        }
        Some((route, remote))
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        plan: ForwardPlan,
        origin: &Arc<str>,
        seq: u64,
        prev_path: &[Arc<str>],
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) {
        let mut path: Vec<Arc<str>> = prev_path.to_vec();
        let mut extend = |id: &Arc<str>| {
            if !path.iter().any(|p| p == id) {
                path.push(id.clone());
            }
        };
        extend(&self.id);
        for target in &plan.targets {
            extend(&target.remote_id);
        }

        for target in plan.targets {
            let msg = RoutedMessage {
                origin: origin.clone(),
                seq,
                path: path.clone(),
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                queues: target.queues,
                payload: payload.clone(),
            };
            trace!(remote = %target.remote_id, subject, seq, "forwarding message");
            target.route.send_rmsg(&msg);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!(server_id = %self.id, "server dropped");
    }
}

async fn bind(addr: &str) -> NexumResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        StackError::new(NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Пишет ошибку в журнал с уровнем, соответствующим её коду.
pub(crate) fn log_error(
    id: u64,
    kind: SessionKind,
    err: &StackError,
) {
    let code = err.status_code();
    match err.log_level() {
        LogLevel::Trace | LogLevel::Debug => debug!(id, %kind, ?code, error = %err, "session error"),
        LogLevel::Info => info!(id, %kind, ?code, error = %err, "session error"),
        LogLevel::Warn => warn!(id, %kind, ?code, error = %err, "session error"),
        LogLevel::Error => error!(id, %kind, ?code, error = %err, "session error"),
    }
}

/// Причина закрытия для фатальной ошибки.
pub(crate) fn close_reason_for(code: StatusCode) -> CloseReason {
    match code {
        StatusCode::AuthFailed => CloseReason::AuthViolation,
        StatusCode::AuthTimeout => CloseReason::AuthTimeout,
        StatusCode::SlowConsumer => CloseReason::SlowConsumer,
        StatusCode::StaleConnection => CloseReason::StaleConnection,
        StatusCode::TooManyConnections => CloseReason::MaxConnections,
        StatusCode::DuplicateRoute => CloseReason::DuplicateRoute,
        StatusCode::SelfRoute => CloseReason::SelfRoute,
        StatusCode::RouteHandshake => CloseReason::RouteHandshake,
        _ => CloseReason::ProtocolError,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn opts() -> Options {
        Options {
            host: "127.0.0.1".into(),
            port: 0,
            ..Options::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        let bad = Options {
            max_payload: 0,
            ..opts()
        };
        let err = Server::new(bad).err().unwrap();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
    }

    #[test]
    fn test_server_ids_are_unique() {
        let a = Server::new(opts()).unwrap();
        let b = Server::new(opts()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
    }

    /// Тест проверяет идемпотентность shutdown.
    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let server = Server::new(opts()).unwrap();
        server.start().await.unwrap();
        assert!(server.client_addr().is_some());
        assert!(server.cluster_addr().is_none());

        server.shutdown();
        server.shutdown();
        assert!(server.is_shutting_down());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = Server::new(opts()).unwrap();
        first.start().await.unwrap();
        let port = first.client_addr().unwrap().port();

        let second = Server::new(Options { port, ..opts() }).unwrap();
        let err = second.start().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BindFailed);
        first.shutdown();
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(close_reason_for(StatusCode::AuthFailed), CloseReason::AuthViolation);
        assert_eq!(close_reason_for(StatusCode::ParseError), CloseReason::ProtocolError);
        assert_eq!(close_reason_for(StatusCode::MaxPayload), CloseReason::ProtocolError);
    }

    #[test]
    fn test_varz_defaults() {
        let server = Server::new(opts()).unwrap();
        let varz = server.varz();
        assert_eq!(varz.connections, 0);
        assert_eq!(varz.subscriptions, 0);
        assert_eq!(varz.version, VERSION);
        assert!(server.connz().connections.is_empty());
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    /// Тест проверяет выбор между двумя маршрутами к одному серверу:
    /// остаётся соединение, инициированное сервером с меньшим id.
    #[test]
    fn test_duplicate_route_resolution() {
        let server = Server::new(opts()).unwrap();
        // id сервера состоит из цифр и заглавных букв, "zz" больше любого.
        let remote: Arc<str> = Arc::from("zz");
        let url: RouteUrl = "nats-route://127.0.0.1:6222".parse().unwrap();

        let accepted = RouteSession::new(server.clone(), 1, addr(), None);
        server.routes.insert(1, accepted.clone());
        server.register_route(&accepted, &remote).unwrap();

        let solicited = RouteSession::new(server.clone(), 2, addr(), Some(url));
        server.routes.insert(2, solicited.clone());
        server.register_route(&solicited, &remote).unwrap();
        assert!(accepted.is_closed());
        assert_eq!(
            accepted.core().close_reason(),
            Some(CloseReason::DuplicateRoute)
        );
        assert_eq!(server.remotes.get(&remote).map(|id| *id), Some(2));

        let late = RouteSession::new(server.clone(), 3, addr(), None);
        server.routes.insert(3, late.clone());
        let err = server.register_route(&late, &remote).unwrap_err();
        assert!(matches!(err, RouteError::DuplicateRoute { .. }));
        assert!(!solicited.is_closed());
        assert!(server.is_route_connected(&remote));
    }

    /// Тест проверяет, что RS-, поставленный во время снятия снимка
    /// интереса, оказывается в буфере маршрута после `SYNC` и снимка.
    #[tokio::test]
    async fn test_interest_sync_precedes_concurrent_announce() {
        let server = Server::new(opts()).unwrap();
        let route = RouteSession::new(server.clone(), 1, addr(), None);

        let concurrent = route.clone();
        let mut announcer = None;
        route.enqueue_interest_sync(|| {
            announcer = Some(std::thread::spawn(move || {
                concurrent.enqueue(b"RS- A 1:1\r\n");
            }));
            std::thread::sleep(Duration::from_millis(50));
            vec![Bytes::from_static(b"RS+ A 1:1 foo\r\n")]
        });
        announcer.unwrap().join().unwrap();

        route.core().outbound.close();
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        route
            .core()
            .outbound
            .flush_loop(&mut tx, Duration::from_secs(1))
            .await
            .unwrap();
        drop(tx);
        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "SYNC 1\r\nRS+ A 1:1 foo\r\nRS- A 1:1\r\n");
    }

    /// Тест проверяет, что управляющая строка, не влезающая в буфер,
    /// выселяет клиента как медленного потребителя.
    #[test]
    fn test_control_line_overflow_evicts_client() {
        let server = Server::new(Options {
            max_payload: 8,
            max_pending_bytes: 16,
            ..opts()
        })
        .unwrap();
        let client = ClientSession::new(server.clone(), 1, addr());

        client.send_info();
        assert!(client.is_closed());
        assert_eq!(client.core().close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(server.stats().slow_consumers(), 1);
    }

    /// Тест проверяет то же для маршрута: переполнение на рукопожатии
    /// закрывает маршрут.
    #[test]
    fn test_control_line_overflow_evicts_route() {
        let server = Server::new(Options {
            max_payload: 8,
            max_pending_bytes: 16,
            ..opts()
        })
        .unwrap();
        let route = RouteSession::new(server.clone(), 1, addr(), None);

        route.start_handshake();
        assert!(route.is_closed());
        assert_eq!(route.core().close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(server.stats().slow_consumers(), 1);
    }
}
