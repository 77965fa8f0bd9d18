//! Predefined device scenarios
//!
//! Each scenario describes a set of attached mock devices and how the
//! transport behaves. They back the CLI's `--simulate` flag and the session
//! tests.

use super::mock_transport::{MockDeviceSpec, MockTransport};
use std::time::Duration;

/// A named, reproducible mock transport setup
#[derive(Debug, Clone)]
pub struct TestScenario {
    /// Scenario name for identification
    pub name: String,
    /// What the scenario simulates
    pub description: String,
    /// Attached devices, in discovery order
    pub devices: Vec<MockDeviceSpec>,
    /// Discovery fails with this message when set
    pub unavailable: Option<String>,
    /// How long discovery blocks before answering
    pub discovery_delay: Option<Duration>,
    /// Tags for filtering scenarios
    pub tags: Vec<String>,
}

impl TestScenario {
    pub fn new(name: &str, description: &str, devices: Vec<MockDeviceSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            devices,
            unavailable: None,
            discovery_delay: None,
            tags: Vec::new(),
        }
    }

    /// Add tags to the scenario
    pub fn with_tags(mut self, tags: Vec<&str>) -> Self {
        self.tags = tags.into_iter().map(String::from).collect();
        self
    }

    /// Build a fresh transport for this scenario
    pub fn transport(&self) -> MockTransport {
        let mut transport = match &self.unavailable {
            Some(msg) => MockTransport::unavailable(msg),
            None => MockTransport::with_devices(self.devices.clone()),
        };
        if let Some(delay) = self.discovery_delay {
            transport = transport.with_discovery_delay(delay);
        }
        transport
    }
}

/// Collection of all predefined scenarios
pub struct ScenarioLibrary;

impl ScenarioLibrary {
    // =========================================================================
    // DISCOVERY
    // =========================================================================

    /// Scenario: nothing attached
    pub fn no_devices() -> TestScenario {
        TestScenario::new("no_devices", "No MTP device connected", Vec::new())
            .with_tags(vec!["discovery", "error"])
    }

    /// Scenario: libusb cannot be initialised
    pub fn usb_unavailable() -> TestScenario {
        let mut scenario = TestScenario::new(
            "usb_unavailable",
            "USB subsystem unavailable during enumeration",
            Vec::new(),
        )
        .with_tags(vec!["discovery", "error"]);
        scenario.unavailable = Some("unable to initialize libusb".to_string());
        scenario
    }

    /// Scenario: enumeration hangs well past any sane timeout
    pub fn slow_discovery() -> TestScenario {
        let mut scenario = TestScenario::new(
            "slow_discovery",
            "Device enumeration takes 30 seconds",
            vec![Self::stocked_player()],
        )
        .with_tags(vec!["discovery", "timeout"]);
        scenario.discovery_delay = Some(Duration::from_secs(30));
        scenario
    }

    // =========================================================================
    // SINGLE DEVICE
    // =========================================================================

    /// Scenario: one player with music, photos and two storages
    pub fn single_player() -> TestScenario {
        TestScenario::new(
            "single_player",
            "One media player with music, a photo and an SD card",
            vec![Self::stocked_player()],
        )
        .with_tags(vec!["device", "basic"])
    }

    /// Scenario: device attached but claimed by another process
    pub fn device_busy() -> TestScenario {
        TestScenario::new(
            "device_busy",
            "Only device is claimed by another process",
            vec![MockDeviceSpec::player("Creative", "ZEN Vision:M")
                .busy("device claimed by another process")],
        )
        .with_tags(vec!["device", "error"])
    }

    /// Scenario: udev rules missing
    pub fn permission_denied() -> TestScenario {
        TestScenario::new(
            "permission_denied",
            "OS denies access to the USB device",
            vec![MockDeviceSpec::player("SanDisk", "Sansa e200")
                .permission_denied("insufficient permissions on /dev/bus/usb/001/004")],
        )
        .with_tags(vec!["device", "error"])
    }

    /// Scenario: session closes with an error
    pub fn close_failure() -> TestScenario {
        TestScenario::new(
            "close_failure",
            "Device reports an error when the session is closed",
            vec![MockDeviceSpec::player("Samsung", "YP-Z5").failing_close()],
        )
        .with_tags(vec!["device", "error"])
    }

    // =========================================================================
    // MULTIPLE DEVICES
    // =========================================================================

    /// Scenario: three devices, the second one busy
    pub fn three_devices_one_busy() -> TestScenario {
        TestScenario::new(
            "three_devices_one_busy",
            "Three devices attached; opening device #2 fails with busy",
            vec![
                MockDeviceSpec::player("Creative", "ZEN").at(1, 3),
                MockDeviceSpec::player("SanDisk", "Sansa Clip").at(1, 4).busy("busy"),
                MockDeviceSpec::player("Samsung", "YP-Z5")
                    .at(2, 2)
                    .with_file("podcast.mp3", vec![0u8; 4096]),
            ],
        )
        .with_tags(vec!["multi", "error"])
    }

    /// Scenario: two healthy devices
    pub fn two_players() -> TestScenario {
        TestScenario::new(
            "two_players",
            "Two healthy players on separate buses",
            vec![
                Self::stocked_player(),
                MockDeviceSpec::player("iRiver", "Clix")
                    .at(2, 5)
                    .with_friendly_name("Running")
                    .with_battery(25, 100),
            ],
        )
        .with_tags(vec!["multi", "basic"])
    }

    fn stocked_player() -> MockDeviceSpec {
        MockDeviceSpec::player("Creative", "ZEN Vision:M")
            .at(1, 4)
            .with_friendly_name("Kitchen player")
            .with_storage(0x0002_0001, "SD card", 8 * 1024 * 1024 * 1024, 6 * 1024 * 1024 * 1024)
            .with_folder("Music")
            .with_folder("Pictures")
            .with_track(
                "01 - Intro.mp3",
                "Intro",
                "The Testers",
                vec![0x49, 0x44, 0x33, 0x03, 0x00],
            )
            .with_track("02 - Theme.flac", "Theme", "The Testers", b"fLaC".repeat(256))
            .with_file("cover.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0])
            .with_album("First Light", &["01 - Intro.mp3", "02 - Theme.flac"])
            .with_playlist("Kitchen mix", &["02 - Theme.flac"])
            .with_secure_clock()
    }

    /// Get all available scenarios
    pub fn all_scenarios() -> Vec<TestScenario> {
        vec![
            Self::no_devices(),
            Self::usb_unavailable(),
            Self::slow_discovery(),
            Self::single_player(),
            Self::device_busy(),
            Self::permission_denied(),
            Self::close_failure(),
            Self::three_devices_one_busy(),
            Self::two_players(),
        ]
    }

    /// Look a scenario up by name
    pub fn get(name: &str) -> Option<TestScenario> {
        Self::all_scenarios().into_iter().find(|s| s.name == name)
    }

    /// Get scenarios by tag
    pub fn scenarios_by_tag(tag: &str) -> Vec<TestScenario> {
        Self::all_scenarios()
            .into_iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{SessionError, TransportError};
    use crate::session::{OpenPolicy, SessionManager, SessionOptions};

    #[test]
    fn test_scenario_names_are_unique() {
        let mut names: Vec<String> = ScenarioLibrary::all_scenarios()
            .into_iter()
            .map(|s| s.name)
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_get_by_name() {
        assert!(ScenarioLibrary::get("single_player").is_some());
        assert!(ScenarioLibrary::get("does_not_exist").is_none());
    }

    #[test]
    fn test_scenario_by_tag() {
        let error_scenarios = ScenarioLibrary::scenarios_by_tag("error");
        assert!(!error_scenarios.is_empty());
        for s in &error_scenarios {
            assert!(s.tags.contains(&"error".to_string()));
        }
    }

    #[test]
    fn test_no_devices_scenario() {
        let manager = SessionManager::new(ScenarioLibrary::no_devices().transport());
        assert!(matches!(manager.connect_one(), Err(SessionError::NoDevice)));
    }

    #[test]
    fn test_usb_unavailable_scenario() {
        let manager = SessionManager::new(ScenarioLibrary::usb_unavailable().transport());
        assert!(matches!(
            manager.list(),
            Err(SessionError::Transport(TransportError::Unavailable(_)))
        ));
    }

    #[test]
    fn test_single_player_contents() {
        let manager = SessionManager::new(ScenarioLibrary::single_player().transport());
        let session = manager.connect_one().unwrap();

        assert_eq!(session.files().unwrap().len(), 3);
        assert_eq!(session.folders().unwrap().len(), 2);
        assert_eq!(session.tracks().unwrap().len(), 2);
        assert_eq!(session.albums().unwrap()[0].tracks.len(), 2);
        assert_eq!(session.playlists().unwrap()[0].name, "Kitchen mix");
        assert_eq!(
            session.identity().unwrap().display_name(),
            "Kitchen player"
        );
    }

    #[test]
    fn test_three_devices_one_busy_best_effort() {
        let manager = SessionManager::with_options(
            ScenarioLibrary::three_devices_one_busy().transport(),
            SessionOptions::default().with_open_policy(OpenPolicy::BestEffort),
        );

        let all = manager.connect_all().unwrap();
        assert_eq!(all.sessions.len(), 2);
        assert_eq!(all.failures.len(), 1);
        assert_eq!(all.sessions[1].files().unwrap().len(), 1);
    }
}
