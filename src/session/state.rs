use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use serde::Serialize;

/// Состояние сессии в её жизненном цикле.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    /// INFO отправлен, ожидается рукопожатие
    AwaitingHandshake = 0,
    /// Рукопожатие получено, проверяются учётные данные
    Authenticating = 1,
    /// Сессия принимает рабочие операции
    Connected = 2,
    /// Выполняется закрытие, буфер дописывается
    Closing = 3,
    /// Терминальное состояние
    Closed = 4,
}

/// Атомарная ячейка состояния сессии.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

/// Вид сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionKind {
    Client,
    Route,
}

/// Причина закрытия сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    ClientClosed,
    ProtocolError,
    AuthViolation,
    AuthTimeout,
    SlowConsumer,
    StaleConnection,
    ReadError,
    WriteError,
    MaxConnections,
    RouteHandshake,
    DuplicateRoute,
    SelfRoute,
    ServerShutdown,
}

/// Потокобезопасная статистика сессии.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub in_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_msgs: AtomicU64,
    pub out_bytes: AtomicU64,
}

/// Снимок сессии для `Server::connz()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub kind: SessionKind,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_server_id: Option<String>,
    pub subscriptions: usize,
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub pending_bytes: usize,
    pub uptime_secs: u64,
    pub idle_secs: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AwaitingHandshake,
            1 => Self::Authenticating,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Сессия завершается или уже завершена.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Переводит сессию в новое состояние.
    ///
    /// Из `Closing`/`Closed` выйти нельзя, кроме перехода
    /// `Closing → Closed`. Возвращает `false`, если переход отклонён.
    pub fn set(
        &self,
        next: ConnectionState,
    ) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let cur = ConnectionState::from_u8(current);
            let allowed = match cur {
                ConnectionState::Closed => false,
                ConnectionState::Closing => next == ConnectionState::Closed,
                _ => true,
            };
            if !allowed {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(
        &self,
        bytes: usize,
    ) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(
        &self,
        bytes: usize,
    ) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn in_msgs(&self) -> u64 {
        self.in_msgs.load(Ordering::Relaxed)
    }

    pub fn out_msgs(&self) -> u64 {
        self.out_msgs.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Route => f.write_str("route"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет прямой путь жизненного цикла.
    #[test]
    fn test_lifecycle_transitions() {
        let cell = StateCell::new(ConnectionState::AwaitingHandshake);
        assert!(cell.set(ConnectionState::Authenticating));
        assert!(cell.set(ConnectionState::Connected));
        assert!(cell.set(ConnectionState::Closing));
        assert!(cell.set(ConnectionState::Closed));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    /// Тест проверяет, что из терминальных состояний нельзя вернуться.
    #[test]
    fn test_terminal_states_are_sticky() {
        let cell = StateCell::new(ConnectionState::Connected);
        assert!(cell.set(ConnectionState::Closing));
        assert!(!cell.set(ConnectionState::Connected));
        assert_eq!(cell.get(), ConnectionState::Closing);

        assert!(cell.set(ConnectionState::Closed));
        assert!(!cell.set(ConnectionState::Closing));
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = SessionStats::new();
        stats.record_in(10);
        stats.record_in(5);
        stats.record_out(7);
        assert_eq!(stats.in_msgs(), 2);
        assert_eq!(stats.in_bytes.load(Ordering::Relaxed), 15);
        assert_eq!(stats.out_msgs(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::AwaitingHandshake.to_string(), "awaiting_handshake");
        assert_eq!(SessionKind::Route.to_string(), "route");
    }
}
