use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки сетевого слоя.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Не удалось привязать слушающий сокет
    BindFailed { addr: String, reason: String },
    /// Не удалось установить исходящее соединение
    ConnectionFailed { addr: String, reason: String },
    /// Удалённая сторона закрыла соединение
    ConnectionClosed,
    /// Истёк таймаут операции
    Timeout { operation: String, timeout_ms: u64 },
}

impl std::fmt::Display for NetworkError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::BindFailed { addr, reason } => write!(f, "Failed to bind {addr}: {reason}"),
            Self::ConnectionFailed { addr, reason } => {
                write!(f, "Failed to connect to {addr}: {reason}")
            }
            Self::ConnectionClosed => write!(f, "Connection closed by peer"),
            Self::Timeout {
                operation,
                timeout_ms,
            } => write!(f, "{operation} timed out after {timeout_ms}ms"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl ErrorExt for NetworkError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BindFailed { .. } => StatusCode::BindFailed,
            Self::ConnectionFailed { .. } => StatusCode::ConnectionFailed,
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::Timeout { .. } => StatusCode::Timeout,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
