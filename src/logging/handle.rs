use std::time::{Duration, Instant};

use tracing_appender::non_blocking::WorkerGuard;

/// Handle для управления жизненным циклом логирования.
///
/// Пока handle жив, фоновый writer `tracing-appender` работает; `shutdown`
/// дописывает буфер.
pub struct LoggingHandle {
    guard: Option<WorkerGuard>,
    flush_timeout: Duration,
    shut_down: bool,
}

impl LoggingHandle {
    pub fn new(guard: Option<WorkerGuard>) -> Self {
        Self {
            guard,
            flush_timeout: Duration::from_secs(5),
            shut_down: false,
        }
    }

    pub fn with_flush_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Сбрасывает буфер и останавливает фоновый writer.
    pub fn shutdown(mut self) {
        self.shut_down = true;
        tracing::debug!("logging shutdown");

        let start = Instant::now();
        drop(self.guard.take());
        let elapsed = start.elapsed();

        if elapsed > self.flush_timeout {
            eprintln!(
                "WARNING: logging shutdown took {}ms (timeout: {}ms)",
                elapsed.as_millis(),
                self.flush_timeout.as_millis()
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for LoggingHandle {
    fn drop(&mut self) {
        if !self.shut_down && self.guard.is_some() {
            eprintln!("WARNING: LoggingHandle dropped without shutdown(), some logs may be lost");
        }
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("active", &self.guard.is_some())
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}
