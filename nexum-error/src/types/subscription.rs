use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки работы с субъектами и подписками.
///
/// Все варианты семантические: сессия продолжает работу, если клиент не
/// запросил строгий режим.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("invalid subject '{subject}'")]
    InvalidSubject { subject: String },
    #[error("invalid publish subject '{subject}'")]
    InvalidPublishSubject { subject: String },
    #[error("unknown subscription identifier '{sid}'")]
    UnknownSid { sid: String },
    #[error("duplicate subscription identifier '{sid}'")]
    DuplicateSid { sid: String },
}

impl ErrorExt for SubscriptionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSubject { .. } => StatusCode::InvalidSubject,
            Self::InvalidPublishSubject { .. } => StatusCode::InvalidPublishSubject,
            Self::UnknownSid { .. } => StatusCode::UnknownSid,
            Self::DuplicateSid { .. } => StatusCode::DuplicateSid,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::InvalidSubject { .. } => "Invalid Subject",
            Self::InvalidPublishSubject { .. } => "Invalid Publish Subject",
            Self::UnknownSid { .. } => "Unknown Subscription Identifier",
            Self::DuplicateSid { .. } => "Duplicate Subscription Identifier",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что ошибки подписок не закрывают сессию вне строгого
    /// режима.
    #[test]
    fn test_fatal_only_when_strict() {
        let err = SubscriptionError::DuplicateSid {
            sid: "1".to_string(),
        };
        assert!(!err.is_fatal(false));
        assert!(err.is_fatal(true));
        assert_eq!(err.client_message(), "Duplicate Subscription Identifier");
    }
}
