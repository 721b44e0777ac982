use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок брокера.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Субъекты и подписки
/// - 3xxx: Авторизация
/// - 4xxx: Лимиты ресурсов
/// - 6xxx: Сеть / IO
/// - 7xxx: Кластер (маршруты)
/// - 8xxx: Протокольные ошибки
/// - 9xxx: Конфигурация
///
/// # Реализация:
/// - `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
/// - опционально: `strum` для `AsRefStr`/`EnumIter` (feature = "strum").
/// - опционально: `serde_repr` для сериализации в виде числового значения
///   (feature = "serde_repr").
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Internal = 1001,
    InvalidArgs = 1002,
    Unsupported = 1003,

    // === 2xxx: Субъекты и подписки ===
    InvalidSubject = 2000,
    InvalidPublishSubject = 2001,
    UnknownSid = 2002,
    DuplicateSid = 2003,

    // === 3xxx: Авторизация ===
    AuthFailed = 3000,
    AuthTimeout = 3001,

    // === 4xxx: Лимиты ===
    MaxPayload = 4000,
    MaxControlLine = 4001,
    TooManyConnections = 4002,
    SlowConsumer = 4003,
    StaleConnection = 4004,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ConnectionFailed = 6003,
    BindFailed = 6004,
    UnexpectedEof = 6005,

    // === 7xxx: Кластер ===
    RouteHandshake = 7000,
    DuplicateRoute = 7001,
    SelfRoute = 7002,
    RouteLost = 7003,

    // === 8xxx: Протокол ===
    UnknownOperation = 8000,
    ParseError = 8001,
    InvalidJson = 8002,
    InvalidUtf8 = 8003,
    InvalidInteger = 8004,
    ExpectedConnect = 8005,

    // === 9xxx: Конфигурация ===
    InvalidConfig = 9000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию имеет смысл повторить.
    ///
    /// Используется дозвоном маршрутов: потеря маршрута или отказ в
    /// соединении приводят к переподключению с backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed
                | Self::ConnectionClosed
                | Self::UnexpectedEof
                | Self::RouteLost
                | Self::RouteHandshake
                | Self::Io
        )
    }

    /// Вернёт `true`, если переданный `code` означает успешный результат.
    pub fn is_success(code: u32) -> bool {
        Self::Success as u32 == code
    }

    /// Синтаксическая ошибка протокола (диапазон 8xxx).
    ///
    /// Такие ошибки всегда фатальны для сессии.
    pub fn is_protocol_error(&self) -> bool {
        (8000..=8999).contains(&self.code())
    }

    /// Семантическая ошибка команды: сообщается клиенту, но сессия
    /// продолжает работу, если не запрошен строгий (pedantic) режим.
    pub fn is_semantic_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSubject
                | Self::InvalidPublishSubject
                | Self::UnknownSid
                | Self::DuplicateSid
                | Self::MaxPayload
        )
    }

    /// Ошибка ресурсов: приводит к выселению сессии, но не к падению
    /// процесса.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::TooManyConnections | Self::SlowConsumer | Self::StaleConnection
        )
    }

    /// Ошибка кластерного маршрута (диапазон 7xxx).
    pub fn is_route_error(&self) -> bool {
        (7000..=7999).contains(&self.code())
    }

    /// Нужно ли закрыть сессию после такой ошибки.
    ///
    /// `strict` соответствует флагу `pedantic` из CONNECT.
    pub fn is_fatal(
        &self,
        strict: bool,
    ) -> bool {
        if self.is_semantic_error() {
            return strict;
        }
        !matches!(self, Self::Success)
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::UnknownSid | Self::DuplicateSid | Self::ConnectionClosed => LogLevel::Debug,
            Self::InvalidSubject
            | Self::InvalidPublishSubject
            | Self::MaxPayload
            | Self::AuthFailed
            | Self::AuthTimeout
            | Self::SelfRoute => LogLevel::Info,
            Self::Internal | Self::BindFailed | Self::InvalidConfig => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что семантические ошибки фатальны только в строгом
    /// режиме.
    #[test]
    fn test_semantic_errors_fatal_only_when_strict() {
        assert!(!StatusCode::UnknownSid.is_fatal(false));
        assert!(StatusCode::UnknownSid.is_fatal(true));
        assert!(!StatusCode::MaxPayload.is_fatal(false));
        assert!(StatusCode::InvalidSubject.is_fatal(true));
    }

    /// Тест проверяет, что протокольные ошибки и ошибки ресурсов фатальны
    /// всегда.
    #[test]
    fn test_protocol_and_resource_errors_always_fatal() {
        assert!(StatusCode::ParseError.is_fatal(false));
        assert!(StatusCode::UnknownOperation.is_fatal(false));
        assert!(StatusCode::SlowConsumer.is_fatal(false));
        assert!(StatusCode::AuthFailed.is_fatal(false));
    }

    /// Тест проверяет классификацию по диапазонам.
    #[test]
    fn test_ranges() {
        assert!(StatusCode::ParseError.is_protocol_error());
        assert!(!StatusCode::UnknownSid.is_protocol_error());
        assert!(StatusCode::DuplicateRoute.is_route_error());
        assert!(StatusCode::SlowConsumer.is_resource_error());
    }

    /// Тест проверяет конвертацию через `TryFrom<u32>`.
    #[test]
    fn test_from_try_from_u32() {
        let n = StatusCode::UnknownSid.code();
        assert_eq!(StatusCode::try_from(n).unwrap(), StatusCode::UnknownSid);
        assert!(StatusCode::from_u32(99999).is_none());
        assert!(StatusCode::is_success(0));
    }

    /// Тест проверяет, что повторяемыми считаются только сетевые и
    /// маршрутные сбои.
    #[test]
    fn test_retryable() {
        assert!(StatusCode::RouteLost.is_retryable());
        assert!(StatusCode::ConnectionFailed.is_retryable());
        assert!(!StatusCode::DuplicateRoute.is_retryable());
        assert!(!StatusCode::AuthFailed.is_retryable());
    }

    /// Тест проверяет формат `Display`.
    #[test]
    fn test_display_contains_name_and_code() {
        let s = format!("{}", StatusCode::SlowConsumer);
        assert!(s.contains("4003"), "got: {s}");
        assert!(s.contains("SlowConsumer"), "got: {s}");
    }
}
