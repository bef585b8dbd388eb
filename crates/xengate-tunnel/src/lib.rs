//! Tunnel forwarding core
//!
//! - [`Tunnel`]: one authenticated session with keepalive and reconnect
//! - [`ConnectionPool`]: a fixed set of tunnels to one server, round-robin
//! - [`Manager`]: pools keyed by server name, admission checks and
//!   least-loaded dispatch of forwarded connections

pub mod backoff;
pub mod error;
pub mod manager;
pub mod pool;
pub mod relay;
pub mod tunnel;

pub use backoff::{Backoff, BackoffConfig, BackoffError};
pub use error::{ManagerError, PoolError, TunnelError};
pub use manager::{Manager, ManagerSettings};
pub use pool::{ConnectionPool, PoolSettings, PoolStats};
pub use relay::{is_normal_close, RelayStats};
pub use tunnel::{ForwardChannel, ForwardSummary, Tunnel, TunnelSettings, TunnelState, TunnelStats};
