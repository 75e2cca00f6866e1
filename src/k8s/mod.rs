pub mod cache;
pub mod client;
pub mod client_manager;
pub mod credentials;
pub mod helm;
pub mod kinds;
pub mod tenant;

/// Default user agent for `KubePulse` - automatically uses the package version
///
/// Every tenant client built by `client_manager::KubeClientFactory` sends it,
/// so API server audit logs can tell streaming traffic apart.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
