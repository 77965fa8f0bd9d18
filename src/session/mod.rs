//! Device sessions and the manager that hands them out
//!
//! - `device` - `DeviceSession`, one exclusive closable connection
//! - `manager` - `SessionManager`, discovery plus owned and scoped access

pub mod device;
pub mod manager;

pub use device::DeviceSession;
pub use manager::{ConnectAll, OpenFailure, OpenPolicy, SessionManager, SessionOptions};
