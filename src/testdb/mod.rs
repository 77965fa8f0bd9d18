//! Test Database Module
//!
//! Simulated MTP devices for exercising the session layer without a real
//! device attached.
//!
//! # Features
//!
//! - **Mock Transport**: In-memory transport with per-device scripted behaviour
//! - **Call Journal**: Ordered record of every discovery, open, close and device call
//! - **Scenarios**: Named setups shared by the tests and the CLI's `--simulate` flag
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mtp_session::session::SessionManager;
//! use mtp_session::testdb::ScenarioLibrary;
//!
//! let scenario = ScenarioLibrary::three_devices_one_busy();
//! let manager = SessionManager::new(scenario.transport());
//! let all = manager.connect_all().unwrap();
//! println!("{} open, {} failed", all.sessions.len(), all.failures.len());
//! ```

pub mod mock_transport;
pub mod scenarios;

pub use mock_transport::{
    CallEvent, CallJournal, MockDeviceSpec, MockFile, MockHandle, MockRawDevice, MockTransport,
    OpenFault,
};
pub use scenarios::{ScenarioLibrary, TestScenario};

/// Get a list of all available scenario names
pub fn list_scenario_names() -> Vec<String> {
    ScenarioLibrary::all_scenarios()
        .into_iter()
        .map(|s| s.name)
        .collect()
}

/// Get a list of all available tags
pub fn list_tags() -> Vec<String> {
    let mut tags: Vec<String> = ScenarioLibrary::all_scenarios()
        .into_iter()
        .flat_map(|s| s.tags)
        .collect();
    tags.sort();
    tags.dedup();
    tags
}
