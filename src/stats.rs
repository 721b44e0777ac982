//! Счётчики брокера и снимки для мониторинга.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::{session::SessionSnapshot, sublist::SublistStats};

/// Глобальные счётчики сервера.
///
/// Обновляются ядром брокера, читаются через [`crate::Server::varz`].
#[derive(Debug, Default)]
pub struct ServerStats {
    pub in_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_msgs: AtomicU64,
    pub out_bytes: AtomicU64,
    pub total_connections: AtomicU64,
    pub connections: AtomicUsize,
    pub routes: AtomicUsize,
    pub slow_consumers: AtomicU64,
    pub rejected_connections: AtomicU64,
}

/// Снимок общей статистики сервера.
#[derive(Debug, Clone, Serialize)]
pub struct Varz {
    pub server_id: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub cluster_port: Option<u16>,
    pub max_payload: usize,
    pub uptime_secs: u64,
    pub connections: usize,
    pub total_connections: u64,
    pub routes: usize,
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub slow_consumers: u64,
    pub rejected_connections: u64,
    pub subscriptions: u64,
    pub sublist: SublistStats,
}

/// Снимок списка соединений.
#[derive(Debug, Clone, Serialize)]
pub struct Connz {
    pub num_connections: usize,
    pub num_routes: usize,
    pub connections: Vec<SessionSnapshot>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Учитывает входящее сообщение (PUB клиента или RMSG маршрута).
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

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn route_opened(&self) {
        self.routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_closed(&self) {
        self.routes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn slow_consumer(&self) {
        self.slow_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_consumers(&self) -> u64 {
        self.slow_consumers.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn routes(&self) -> usize {
        self.routes.load(Ordering::Relaxed)
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.connections(), 1);
        assert_eq!(stats.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_message_counters() {
        let stats = ServerStats::new();
        stats.record_in(5);
        stats.record_out(5);
        stats.record_out(7);
        assert_eq!(stats.in_bytes.load(Ordering::Relaxed), 5);
        assert_eq!(stats.out_msgs.load(Ordering::Relaxed), 2);
        assert_eq!(stats.out_bytes.load(Ordering::Relaxed), 12);
    }
}
