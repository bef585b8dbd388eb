//! Source-IP admission for forwarded connections
//!
//! - [`IpBlocklist`]: addresses refused outright
//! - [`AccessControl`]: per-IP daily time quotas with master (exempt) rules

pub mod access_control;
pub mod blocklist;

pub use access_control::{
    AccessControl, AccessError, AccessRule, AccessStatus, NewRule, SessionGuard,
};
pub use blocklist::IpBlocklist;
