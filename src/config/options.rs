use std::time::Duration;

use config::{Config, ConfigError, Environment};
use nexum_error::{ensure, GenericError, NexumResult, StackError, StatusCode};
use serde::{Deserialize, Serialize};

use super::routes::RouteUrl;

/// Префикс переменных окружения.
pub const ENV_PREFIX: &str = "NEXUM";

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_CLUSTER_PORT: u16 = 6222;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const DEFAULT_MAX_CONTROL_LINE: usize = 1024;

/// Полностью разрешённая конфигурация сервера.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub cluster_host: String,
    /// `None` отключает кластер, `Some(0)` выбирает свободный порт.
    pub cluster_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Токен авторизации клиентов.
    pub authorization: Option<String>,
    pub cluster_username: Option<String>,
    pub cluster_password: Option<String>,
    /// URL маршрутов вида `nats-route://[user:pass@]host:port`.
    pub routes: Vec<String>,
    pub max_connections: usize,
    pub max_payload: usize,
    pub max_control_line: usize,
    pub max_pending_bytes: usize,
    pub max_pending_msgs: usize,
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    pub max_pings_out: u32,
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_deadline: Duration,
    #[serde(with = "duration_ms")]
    pub route_handshake_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub route_reconnect_base: Duration,
    #[serde(with = "duration_ms")]
    pub route_reconnect_max: Duration,
    pub debug: bool,
    pub trace: bool,
    pub logtime: bool,
}

impl Options {
    /// Значения по умолчанию, поверх которых наложены `NEXUM_*`.
    pub fn from_env() -> NexumResult<Self> {
        Self::from_environment(Self::environment())
    }

    /// Загружает параметры из указанного источника окружения.
    pub fn from_environment(env: Environment) -> NexumResult<Self> {
        Config::builder()
            .add_source(env)
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(config_error)
    }

    /// Источник `NEXUM_*` с разбором списков и чисел.
    pub fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("routes")
    }

    /// Проверяет согласованность лимитов и адресов.
    pub fn validate(&self) -> NexumResult<()> {
        ensure!(
            self.max_payload > 0,
            StatusCode::InvalidConfig,
            "max_payload must be positive"
        );
        ensure!(
            self.max_control_line >= 64,
            StatusCode::InvalidConfig,
            "max_control_line must be at least 64 bytes, got {}",
            self.max_control_line
        );
        ensure!(
            self.max_pending_bytes >= self.max_payload,
            StatusCode::InvalidConfig,
            "max_pending_bytes ({}) must not be smaller than max_payload ({})",
            self.max_pending_bytes,
            self.max_payload
        );
        ensure!(
            self.max_pending_msgs > 0,
            StatusCode::InvalidConfig,
            "max_pending_msgs must be positive"
        );
        ensure!(
            self.max_connections > 0,
            StatusCode::InvalidConfig,
            "max_connections must be positive"
        );
        ensure!(
            self.max_pings_out > 0 && !self.ping_interval.is_zero(),
            StatusCode::InvalidConfig,
            "ping_interval and max_pings_out must be positive"
        );
        ensure!(
            self.route_reconnect_base <= self.route_reconnect_max,
            StatusCode::InvalidConfig,
            "route_reconnect_base must not exceed route_reconnect_max"
        );
        ensure!(
            self.username.is_some() == self.password.is_some(),
            StatusCode::InvalidConfig,
            "username and password must be set together"
        );
        ensure!(
            self.cluster_username.is_some() == self.cluster_password.is_some(),
            StatusCode::InvalidConfig,
            "cluster_username and cluster_password must be set together"
        );
        ensure!(
            self.routes.is_empty() || self.cluster_port.is_some(),
            StatusCode::InvalidConfig,
            "routes require cluster_port"
        );
        self.route_urls()?;
        Ok(())
    }

    /// Разобранные URL маршрутов.
    pub fn route_urls(&self) -> NexumResult<Vec<RouteUrl>> {
        self.routes
            .iter()
            .map(|raw| raw.parse::<RouteUrl>().map_err(StackError::from))
            .collect()
    }

    pub fn client_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cluster_listen_addr(&self) -> Option<String> {
        self.cluster_port
            .map(|port| format!("{}:{}", self.cluster_host, port))
    }

    /// Клиенты должны предъявить учётные данные.
    pub fn auth_required(&self) -> bool {
        self.username.is_some() || self.authorization.is_some()
    }

    pub fn cluster_auth_required(&self) -> bool {
        self.cluster_username.is_some()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            cluster_host: "0.0.0.0".to_string(),
            cluster_port: None,
            username: None,
            password: None,
            authorization: None,
            cluster_username: None,
            cluster_password: None,
            routes: Vec::new(),
            max_connections: 64 * 1024,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            max_pending_bytes: 10 * 1024 * 1024,
            max_pending_msgs: 64 * 1024,
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            auth_timeout: Duration::from_secs(1),
            write_deadline: Duration::from_secs(2),
            route_handshake_timeout: Duration::from_secs(2),
            route_reconnect_base: Duration::from_millis(100),
            route_reconnect_max: Duration::from_secs(10),
            debug: false,
            trace: false,
            logtime: true,
        }
    }
}

fn config_error(err: ConfigError) -> StackError {
    StackError::new(GenericError::new(StatusCode::InvalidConfig, err.to_string()))
}

/// Длительности в конфигурации задаются в миллисекундах.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
