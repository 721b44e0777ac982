use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Синтаксические ошибки потока команд.
///
/// Любая из них фатальна для сессии: поток нельзя надёжно
/// ресинхронизировать.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Неизвестное имя операции
    #[error("unknown protocol operation '{op}'")]
    UnknownOperation { op: String },
    /// Неверное количество или формат аргументов
    #[error("invalid arguments for {op}: {reason}")]
    InvalidArguments { op: &'static str, reason: String },
    /// Управляющая строка длиннее лимита
    #[error("control line exceeds {max} bytes")]
    ControlLineTooLong { max: usize },
    /// После payload нет завершающего CRLF
    #[error("payload for {op} is not terminated by CRLF")]
    MissingPayloadTerminator { op: &'static str },
    /// Невалидный JSON в INFO/CONNECT
    #[error("invalid JSON in {op}: {reason}")]
    InvalidJson { op: &'static str, reason: String },
    /// Невалидный UTF-8 в управляющей строке
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
    /// Невалидное число (размер payload, счётчики)
    #[error("invalid number '{value}' in {op}")]
    InvalidNumber { op: &'static str, value: String },
    /// Первая команда клиента — не CONNECT
    #[error("expected CONNECT, got {op}")]
    ExpectedConnect { op: String },
    /// Операция недопустима для данного вида сессии
    #[error("operation {op} is not allowed on this connection")]
    NotAllowed { op: String },
}

impl ErrorExt for ProtocolError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownOperation { .. } | Self::NotAllowed { .. } => StatusCode::UnknownOperation,
            Self::InvalidArguments { .. } | Self::MissingPayloadTerminator { .. } => {
                StatusCode::ParseError
            }
            Self::ControlLineTooLong { .. } => StatusCode::MaxControlLine,
            Self::InvalidJson { .. } => StatusCode::InvalidJson,
            Self::InvalidUtf8 => StatusCode::InvalidUtf8,
            Self::InvalidNumber { .. } => StatusCode::InvalidInteger,
            Self::ExpectedConnect { .. } => StatusCode::ExpectedConnect,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::UnknownOperation { .. } | Self::NotAllowed { .. } => {
                "Unknown Protocol Operation".to_string()
            }
            Self::ControlLineTooLong { .. } => "Maximum Control Line Exceeded".to_string(),
            Self::ExpectedConnect { .. } => "Expected CONNECT".to_string(),
            _ => "Parser Error".to_string(),
        }
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "protocol".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Self::UnknownOperation { op } = self {
            tags.push(("op", op.clone()));
        }
        tags
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
