use std::{net::SocketAddr, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    net::TcpStream,
    select,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::RouteUrl,
    server::Server,
    session::{wait_closed, CloseReason},
};

/// Экспоненциальная задержка переподключения с небольшим джиттером.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(
        base: Duration,
        max: Duration,
    ) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Следующая задержка; каждая следующая вдвое больше, но не выше `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
        (delay + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Поддерживает исходящий маршрут к `url`, пока сервер работает.
pub async fn run(
    server: Arc<Server>,
    url: RouteUrl,
) {
    let opts = server.opts().clone();
    let mut shutdown = server.shutdown_signal();
    let mut backoff = Backoff::new(opts.route_reconnect_base, opts.route_reconnect_max);

    loop {
        if server.is_shutting_down() {
            break;
        }

        let connect = timeout(opts.route_handshake_timeout, TcpStream::connect(url.authority()));
        let attempt = select! {
            _ = wait_closed(&mut shutdown) => break,
            res = connect => res,
        };

        match attempt {
            Ok(Ok(stream)) => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], url.port)));
                let outcome = server.clone().run_route(stream, addr, Some(url.clone())).await;
                debug!(url = %url, reason = ?outcome.reason, "solicited route ended");

                match outcome.reason {
                    Some(CloseReason::SelfRoute) => {
                        info!(url = %url, "route points to this server, not reconnecting");
                        break;
                    }
                    Some(CloseReason::ServerShutdown) => break,
                    Some(CloseReason::DuplicateRoute) => {
                        // Пока живо другое соединение с тем же сервером,
                        // только периодически проверяем его.
                        loop {
                            select! {
                                _ = wait_closed(&mut shutdown) => return,
                                _ = sleep(opts.route_reconnect_max) => {}
                            }
                            let still_connected = outcome
                                .remote_id
                                .as_deref()
                                .map(|id| server.is_route_connected(id))
                                .unwrap_or(false);
                            if !still_connected {
                                break;
                            }
                        }
                        backoff.reset();
                        continue;
                    }
                    _ if outcome.established => backoff.reset(),
                    _ => {}
                }
            }
            Ok(Err(e)) => debug!(url = %url, error = %e, "route connect failed"),
            Err(_) => warn!(url = %url, "route connect timed out"),
        }

        let delay = backoff.next_delay();
        debug!(url = %url, delay_ms = delay.as_millis() as u64, "reconnecting route");
        select! {
            _ = wait_closed(&mut shutdown) => break,
            _ = sleep(delay) => {}
        }
    }
    debug!(url = %url, "route dialer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет рост задержки и её ограничение сверху.
    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(110));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200));
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(20));
    }
}
