//! JSON-полезная нагрузка строк `INFO` и `CONNECT`.

use nexum_error::ProtocolError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// `INFO`, отправляемый клиенту сразу после accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub auth_required: bool,
    pub ssl_required: bool,
    pub max_payload: usize,
}

/// `INFO`, которым обмениваются серверы при установке маршрута.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cluster_port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub routes: Vec<String>,
}

/// `CONNECT` от клиента. Неизвестные поля игнорируются.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConnect {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub ssl_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `CONNECT`, которым инициирующий сервер представляется на маршруте.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConnect {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Default for ClientConnect {
    fn default() -> Self {
        Self {
            verbose: true,
            pedantic: false,
            user: None,
            pass: None,
            auth_token: None,
            ssl_required: false,
            name: None,
            lang: None,
            version: None,
        }
    }
}

/// Разбирает JSON-аргумент `INFO`/`CONNECT`.
///
/// Пустой аргумент трактуется как `{}`.
pub fn parse_json<T: DeserializeOwned>(
    op: &'static str,
    raw: &str,
) -> Result<T, ProtocolError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson {
        op,
        reason: e.to_string(),
    })
}
