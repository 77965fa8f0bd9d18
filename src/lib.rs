//! MTP Session Library
//!
//! Discover MTP devices (media players, phones) and manage sessions to them
//! over an interchangeable transport.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`core`] - Configuration and error types
//! - [`device`] - Transport traits, device data types and the libmtp binding
//! - [`session`] - `DeviceSession` and the `SessionManager` that hands them out
//! - [`cli`] - Command-line interface (only used by the binary)
//! - [`testdb`] - Mock transport and named device scenarios for testing
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use mtp_session::session::SessionManager;
//! use mtp_session::testdb::ScenarioLibrary;
//!
//! fn main() -> anyhow::Result<()> {
//!     // Any `Transport` works here, e.g. `device::LibmtpTransport`
//!     let manager = SessionManager::new(ScenarioLibrary::single_player().transport());
//!
//!     for device in manager.list()? {
//!         println!("{}", device.label());
//!     }
//!
//!     // The session is closed when the closure returns
//!     let files = manager.connect_one_with(|session| session.files())?;
//!     println!("{} file(s)", files.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Testing Without a Device
//!
//! ```rust,no_run
//! use mtp_session::session::{OpenPolicy, SessionManager, SessionOptions};
//! use mtp_session::testdb::ScenarioLibrary;
//!
//! let manager = SessionManager::with_options(
//!     ScenarioLibrary::three_devices_one_busy().transport(),
//!     SessionOptions::default().with_open_policy(OpenPolicy::BestEffort),
//! );
//! let all = manager.connect_all().unwrap();
//! assert_eq!(all.failures.len(), 1);
//! ```

pub mod cli;
pub mod core;
pub mod device;
pub mod session;
pub mod testdb;
