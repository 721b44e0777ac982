//! Кластерные маршруты: сессия маршрута, счётчики интереса и дозвон.

pub mod cluster;
pub mod dialer;
pub mod session;

pub use cluster::{Cluster, SEEN_CACHE_SIZE};
pub use dialer::Backoff;
pub use session::RouteSession;
