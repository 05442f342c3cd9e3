//! Target session management - one cached agent session per target, leased
//! to one task at a time

mod manager;

pub use manager::{SessionManager, SessionManagerConfig};
