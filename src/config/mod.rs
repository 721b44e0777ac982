pub mod options;
pub mod routes;

pub use options::Options;
pub use routes::{remove_self_references, RouteUrl};
