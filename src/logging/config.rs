use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::config::Options;

/// Формат строк журнала.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Настройки консольного журнала.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Базовый уровень: `error`, `warn`, `info`, `debug` или `trace`.
    pub level: String,
    pub format: LogFormat,
    /// Цвета в консоли.
    pub ansi: bool,
    /// Печатать ли время события.
    pub logtime: bool,
}

impl LoggingConfig {
    /// Уровень по флагам сервера: `-D` даёт debug, `-V` даёт trace.
    pub fn from_options(opts: &Options) -> Self {
        let level = match (opts.debug, opts.trace) {
            (_, true) => "trace",
            (true, false) => "debug",
            _ => "info",
        };
        Self {
            level: level.to_string(),
            logtime: opts.logtime,
            ..Default::default()
        }
    }

    /// Директива `EnvFilter` для нашего крейта.
    ///
    /// Сторонние крейты остаются на `warn`, чтобы trace сервера не тонул
    /// в их событиях.
    pub fn build_filter_directive(&self) -> String {
        format!("warn,nexum={lvl},nexum_server={lvl}", lvl = self.level)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
            logtime: true,
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            LogFormat::Compact => "compact",
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        };
        f.write_str(name)
    }
}
