use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки кластерных маршрутов.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route handshake failed: {reason}")]
    HandshakeFailed { reason: String },
    #[error("duplicate route to server '{server_id}'")]
    DuplicateRoute { server_id: String },
    #[error("route points to this server")]
    SelfRoute,
    #[error("route to '{server_id}' lost")]
    Lost { server_id: String },
}

impl ErrorExt for RouteError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::HandshakeFailed { .. } => StatusCode::RouteHandshake,
            Self::DuplicateRoute { .. } => StatusCode::DuplicateRoute,
            Self::SelfRoute => StatusCode::SelfRoute,
            Self::Lost { .. } => StatusCode::RouteLost,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::DuplicateRoute { .. } => "Duplicate Route".to_string(),
            Self::HandshakeFailed { .. } => "Parser Error".to_string(),
            other => other.to_string(),
        }
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![("error_type", "route".to_string())];
        match self {
            Self::DuplicateRoute { server_id } | Self::Lost { server_id } => {
                tags.push(("remote", server_id.clone()));
            }
            _ => {}
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_route_not_retryable() {
        let err = RouteError::DuplicateRoute {
            server_id: "abc".to_string(),
        };
        assert!(!err.status_code().is_retryable());
        assert_eq!(err.client_message(), "Duplicate Route");
        assert!(RouteError::Lost {
            server_id: "abc".to_string()
        }
        .status_code()
        .is_retryable());
    }
}
