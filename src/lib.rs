/// Credential checking: user/password, token, argon2 hashes.
pub mod auth;
/// Startup banner.
pub mod banner;
/// Client session protocol state machine.
pub mod client;
/// Server options and route URLs.
pub mod config;
/// Console logging (tracing-subscriber).
pub mod logging;
/// Wire protocol: operations, parser, encoders, INFO/CONNECT payloads.
pub mod protocol;
/// Subscription registry: sids, queue groups, auto-unsubscribe.
pub mod registry;
/// Cluster routes: route session, interest refcounts, dialer.
pub mod route;
/// Broker core: listeners, fan-out, cluster forwarding.
pub mod server;
/// Shared session interface, outbound buffer, connection state.
pub mod session;
/// Server-wide counters and monitoring snapshots.
pub mod stats;
/// Subject tokens and wildcard matching.
pub mod subject;
/// Subject matcher tree.
pub mod sublist;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

pub use auth::{hash_password, verify_password, Authenticator, Credentials};
pub use config::{Options, RouteUrl};
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
pub use nexum_error::{NexumResult, StackError, StatusCode};
pub use registry::{Registry, Subscription};
pub use server::{Server, VERSION};
pub use session::{CloseReason, ConnectionState, Session, SessionKind};
pub use stats::{Connz, ServerStats, Varz};
pub use sublist::{Sublist, SublistResult, SublistStats};
