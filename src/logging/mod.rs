//! Консольное логирование поверх `tracing-subscriber`.

pub mod config;
mod filters;
pub mod handle;

pub use config::{LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Инициализация логирования с конфигурацией.
///
/// Повторная инициализация в одном процессе возвращает ошибку.
pub fn init_logging(
    config: LoggingConfig
) -> Result<LoggingHandle, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = filters::build_filter_from_config(&config);
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let layer = console_layer(&config, writer).with_filter(env_filter).boxed();
    tracing_subscriber::registry().with(layer).try_init()?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        format = %config.format,
        "logging initialized"
    );
    Ok(LoggingHandle::new(Some(guard)))
}

fn console_layer(
    config: &LoggingConfig,
    writer: tracing_appender::non_blocking::NonBlocking,
) -> BoxedLayer {
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.ansi)
        .with_target(false);

    match (config.format, config.logtime) {
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что слой строится для всех сочетаний формата и времени.
    #[test]
    fn test_console_layer_variants() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            for logtime in [true, false] {
                let cfg = LoggingConfig {
                    format,
                    logtime,
                    ansi: false,
                    ..Default::default()
                };
                let (writer, _guard) = tracing_appender::non_blocking(std::io::sink());
                let layer = console_layer(&cfg, writer);
                let subscriber = Registry::default().with(layer);
                tracing::subscriber::with_default(subscriber, || {
                    tracing::info!(format = %format, logtime, "layer smoke test");
                });
            }
        }
    }
}
