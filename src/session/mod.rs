//! Общий интерфейс клиентских и маршрутных сессий.
//!
//! Ядро брокера работает с сессиями только через трейт [`Session`]; общие
//! для обоих видов части (исходящий буфер, состояние, статистика,
//! heartbeat, закрытие) собраны в [`SessionCore`].

pub mod outbound;
pub mod state;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::watch,
};
use tracing::{debug, warn};

pub use outbound::{FlushError, Outbound, OutboundError};
pub use state::{CloseReason, ConnectionState, SessionKind, SessionSnapshot, SessionStats, StateCell};

use crate::registry::Subscription;

/// Размер буфера чтения сокета.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Интерфейс сессии, с которым работает ядро брокера.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Общие части сессии.
    fn core(&self) -> &SessionCore;

    fn kind(&self) -> SessionKind;

    /// Закрывает сессию. Повторный вызов ничего не делает.
    fn close(
        &self,
        reason: CloseReason,
    );

    /// Ставит в очередь сообщение для подписки этой сессии.
    ///
    /// Возвращает `false`, если сессия закрыта или была выселена.
    fn deliver(
        &self,
        sub: &Subscription,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> bool;

    /// Читает и обрабатывает входящий поток до закрытия сессии.
    async fn read_loop(
        self: Arc<Self>,
        reader: OwnedReadHalf,
    );

    /// Дописывает исходящий буфер в сокет до закрытия сессии.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
    ) {
        let deadline = self.core().write_deadline;
        match self.core().outbound.flush_loop(&mut writer, deadline).await {
            Ok(written) => debug!(id = self.id(), kind = %self.kind(), written, "writer finished"),
            Err(FlushError::Deadline(d)) => {
                warn!(id = self.id(), kind = %self.kind(), deadline_ms = d.as_millis() as u64, "write deadline exceeded");
                self.close(CloseReason::SlowConsumer);
            }
            Err(FlushError::Io(e)) => {
                debug!(id = self.id(), kind = %self.kind(), error = %e, "write failed");
                self.close(CloseReason::WriteError);
            }
        }
    }

    /// Идентификатор удалённого сервера (только для маршрутов).
    fn remote_server_id(&self) -> Option<Arc<str>> {
        None
    }

    /// Имя, объявленное удалённой стороной.
    fn name(&self) -> Option<String> {
        None
    }

    fn id(&self) -> u64 {
        self.core().id
    }

    fn is_closed(&self) -> bool {
        self.core().is_closed()
    }

    fn snapshot(
        &self,
        subscriptions: usize,
    ) -> SessionSnapshot {
        let core = self.core();
        SessionSnapshot {
            id: core.id,
            kind: self.kind(),
            addr: core.addr,
            state: core.state.get(),
            name: self.name(),
            remote_server_id: self.remote_server_id().map(|s| s.to_string()),
            subscriptions,
            in_msgs: core.stats.in_msgs(),
            in_bytes: core.stats.in_bytes.load(Ordering::Relaxed),
            out_msgs: core.stats.out_msgs(),
            out_bytes: core.stats.out_bytes.load(Ordering::Relaxed),
            pending_bytes: core.outbound.pending_bytes(),
            uptime_secs: core.connected_at.elapsed().as_secs(),
            idle_secs: core.idle_time().as_secs(),
        }
    }
}

/// Части сессии, общие для клиентов и маршрутов.
#[derive(Debug)]
pub struct SessionCore {
    pub id: u64,
    pub addr: SocketAddr,
    pub outbound: Outbound,
    pub stats: SessionStats,
    pub state: StateCell,
    pub write_deadline: Duration,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    close_tx: watch::Sender<bool>,
    pings_out: AtomicU32,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
}

/// Результат тика heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Пора отправить PING
    Ping,
    /// Превышен лимит PING без ответа
    Stale,
}

impl SessionCore {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        max_pending_bytes: usize,
        max_pending_msgs: usize,
        write_deadline: Duration,
    ) -> Self {
        let now = Instant::now();
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            addr,
            outbound: Outbound::new(max_pending_bytes, max_pending_msgs),
            stats: SessionStats::new(),
            state: StateCell::new(ConnectionState::AwaitingHandshake),
            write_deadline,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            close_tx,
            pings_out: AtomicU32::new(0),
            connected_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Помечает сессию закрытой.
    ///
    /// Возвращает `true` только для первого вызова: очистка выполняется
    /// ровно один раз.
    pub fn begin_close(
        &self,
        reason: CloseReason,
    ) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.state.set(ConnectionState::Closing);

        if reason == CloseReason::SlowConsumer {
            self.outbound.abort();
        } else {
            self.outbound.close();
        }
        self.close_tx.send_replace(true);
        true
    }

    /// Завершает закрытие после очистки.
    pub fn finish_close(&self) {
        self.state.set(ConnectionState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Подписка на сигнал закрытия.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Ставит управляющую строку в очередь.
    ///
    /// Ошибка лимита означает медленного потребителя: вызывающий обязан
    /// выселить сессию.
    pub fn send(
        &self,
        data: &[u8],
    ) -> Result<(), OutboundError> {
        self.outbound.push(data)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Тик heartbeat: учитывает очередной PING или сообщает о зависшем
    /// соединении. Сам PING отправляет сессия.
    pub fn heartbeat(
        &self,
        max_pings_out: u32,
    ) -> Heartbeat {
        let outstanding = self.pings_out.fetch_add(1, Ordering::AcqRel) + 1;
        if outstanding > max_pings_out {
            return Heartbeat::Stale;
        }
        Heartbeat::Ping
    }

    /// PONG сбрасывает счётчик неотвеченных PING.
    pub fn pong_received(&self) {
        self.pings_out.store(0, Ordering::Release);
    }

    pub fn pings_out(&self) -> u32 {
        self.pings_out.load(Ordering::Acquire)
    }
}

/// Ожидает сигнала закрытия.
pub async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
