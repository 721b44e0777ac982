use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки уровня сессии: авторизация, лимиты и здоровье соединения.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("authorization violation")]
    AuthorizationViolation,
    #[error("authorization timeout after {timeout_ms}ms")]
    AuthTimeout { timeout_ms: u64 },
    #[error("payload of {size} bytes exceeds maximum {max}")]
    MaxPayload { size: usize, max: usize },
    #[error("slow consumer: {reason}")]
    SlowConsumer { reason: String },
    #[error("stale connection: {pings_out} pings without reply")]
    StaleConnection { pings_out: u32 },
    #[error("maximum connections ({max}) exceeded")]
    TooManyConnections { max: usize },
    #[error("session closed")]
    Closed,
}

impl ErrorExt for SessionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthorizationViolation => StatusCode::AuthFailed,
            Self::AuthTimeout { .. } => StatusCode::AuthTimeout,
            Self::MaxPayload { .. } => StatusCode::MaxPayload,
            Self::SlowConsumer { .. } => StatusCode::SlowConsumer,
            Self::StaleConnection { .. } => StatusCode::StaleConnection,
            Self::TooManyConnections { .. } => StatusCode::TooManyConnections,
            Self::Closed => StatusCode::ConnectionClosed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::AuthorizationViolation => "Authorization Violation",
            Self::AuthTimeout { .. } => "Authorization Timeout",
            Self::MaxPayload { .. } => "Maximum Payload Exceeded",
            Self::SlowConsumer { .. } => "Slow Consumer",
            Self::StaleConnection { .. } => "Stale Connection",
            Self::TooManyConnections { .. } => "Maximum Connections Exceeded",
            Self::Closed => "Connection Closed",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(
            SessionError::AuthTimeout { timeout_ms: 1000 }.client_message(),
            "Authorization Timeout"
        );
        assert_eq!(
            SessionError::TooManyConnections { max: 1 }.client_message(),
            "Maximum Connections Exceeded"
        );
    }

    /// Тест проверяет, что превышение payload фатально только в строгом
    /// режиме, а авторизация — всегда.
    #[test]
    fn test_fatality() {
        let payload = SessionError::MaxPayload { size: 10, max: 5 };
        assert!(!payload.is_fatal(false));
        assert!(payload.is_fatal(true));
        assert!(SessionError::AuthorizationViolation.is_fatal(false));
    }
}
