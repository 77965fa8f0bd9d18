//! Transport abstraction traits for testability
//!
//! This module defines the boundary between the session layer and whatever
//! actually talks to the hardware. The native libmtp transport and the mock
//! transport both implement these traits, so the session manager works with
//! either.
//!
//! # Architecture
//!
//! The trait hierarchy is:
//! - `Transport` - Discovers raw devices and opens/closes sessions
//! - `RawDevice` - A discovered device that has not been opened yet
//! - `DeviceOps` - Operations on an opened device handle
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use mtp_session::device::traits::{DeviceOps, RawDevice, Transport};
//!
//! fn print_first<T: Transport>(transport: &T) -> Result<(), String> {
//!     let mut devices = transport.list_devices().map_err(|e| e.to_string())?;
//!     if devices.is_empty() {
//!         return Ok(());
//!     }
//!     let raw = devices.remove(0);
//!     println!("Opening {}", raw.info().label());
//!     let handle = transport.open_session(raw).map_err(|e| e.to_string())?;
//!     println!("{:?}", handle.identity());
//!     transport.close_session(handle).map_err(|e| e.to_string())
//! }
//! ```

use crate::core::error::TransportResult;
use crate::device::filetype::Filetype;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;

/// Entry from the transport's table of known devices (vendor/product ids)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Vendor name (e.g., "Creative")
    pub vendor: Option<String>,
    /// USB vendor id
    pub vendor_id: u16,
    /// Product name (e.g., "ZEN Vision:M")
    pub product: Option<String>,
    /// USB product id
    pub product_id: u16,
    /// libmtp device quirk flags
    pub device_flags: u32,
}

impl DeviceEntry {
    /// Create a new DeviceEntry
    pub fn new(vendor: &str, vendor_id: u16, product: &str, product_id: u16) -> Self {
        Self {
            vendor: Some(vendor.to_string()),
            vendor_id,
            product: Some(product.to_string()),
            product_id,
            device_flags: 0,
        }
    }
}

impl Display for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({:04x}:{:04x})",
            self.vendor.as_deref().unwrap_or("Unknown vendor"),
            self.product.as_deref().unwrap_or("Unknown product"),
            self.vendor_id,
            self.product_id
        )
    }
}

/// Description of a discovered, not yet opened device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceInfo {
    /// Matching entry from the known-device table
    pub entry: DeviceEntry,
    /// USB bus the device sits on
    pub bus_location: u32,
    /// Device number on that bus
    pub devnum: u8,
}

impl RawDeviceInfo {
    /// Short label used in logs and failure reports
    pub fn label(&self) -> String {
        format!("{} @ bus {} dev {}", self.entry, self.bus_location, self.devnum)
    }
}

/// A device found by discovery. Consumed by `Transport::open_session`.
pub trait RawDevice: Send + 'static {
    /// Describe the device without opening it
    fn info(&self) -> RawDeviceInfo;
}

/// Identity strings reported by an opened device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub version: Option<String>,
    /// User-assigned name (e.g., "Kitchen MP3 player")
    pub friendly_name: Option<String>,
}

impl DeviceIdentity {
    /// Best name to show a user: friendly name, then model, then manufacturer
    pub fn display_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .or(self.model.as_deref())
            .or(self.manufacturer.as_deref())
            .unwrap_or("Unnamed device")
    }
}

/// Battery level as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryLevel {
    pub max: u8,
    pub current: u8,
}

impl BatteryLevel {
    /// Charge as a percentage, `None` when the device reports no scale
    pub fn percent(&self) -> Option<u8> {
        if self.max == 0 {
            return None;
        }
        Some(((self.current as u32 * 100) / self.max as u32).min(100) as u8)
    }
}

/// Order in which storages are returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSort {
    /// Device order
    #[default]
    NotSorted,
    /// Most free space first
    FreeSpace,
    /// Largest capacity first
    MaxSpace,
}

impl StorageSort {
    /// The libmtp `LIBMTP_STORAGE_SORTBY_*` value
    pub fn code(self) -> i32 {
        match self {
            StorageSort::NotSorted => 0,
            StorageSort::FreeSpace => 1,
            StorageSort::MaxSpace => 2,
        }
    }

    /// Sort a storage list in place the way the device would
    pub fn apply(self, storages: &mut [StorageInfo]) {
        match self {
            StorageSort::NotSorted => {}
            StorageSort::FreeSpace => {
                storages.sort_by(|a, b| b.free_space_bytes.cmp(&a.free_space_bytes))
            }
            StorageSort::MaxSpace => storages.sort_by(|a, b| b.max_capacity.cmp(&a.max_capacity)),
        }
    }
}

/// One storage (internal memory, SD card, ...) on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub id: u32,
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_objects: u64,
    pub description: Option<String>,
    pub volume_id: Option<String>,
}

impl StorageInfo {
    pub fn used_bytes(&self) -> u64 {
        self.max_capacity.saturating_sub(self.free_space_bytes)
    }

    /// Access capability 0 is read-write in PTP
    pub fn is_writable(&self) -> bool {
        self.access_capability == 0
    }
}

/// A file stored on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: u32,
    /// Parent folder id (0 for the storage root)
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub filetype: Filetype,
}

/// A folder stored on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub id: u32,
    /// Parent folder id (0 for the storage root)
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
}

/// Metadata for a file being sent to a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewFile {
    /// Name the file gets on the device
    pub name: String,
    /// Destination folder (0 for the storage root)
    pub parent_id: u32,
    /// Destination storage (0 lets the device choose)
    pub storage_id: u32,
    pub filetype: Filetype,
}

impl NewFile {
    /// Metadata derived from a local path: same file name, guessed type
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            parent_id: 0,
            storage_id: 0,
            filetype: Filetype::from_path(path),
        }
    }

    pub fn with_parent(mut self, parent_id: u32) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_storage(mut self, storage_id: u32) -> Self {
        self.storage_id = storage_id;
        self
    }
}

/// A track: an audio or video file carrying media metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: u32,
    pub parent_id: u32,
    pub storage_id: u32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub composer: Option<String>,
    pub genre: Option<String>,
    pub album: Option<String>,
    /// Release date as the device stores it (e.g. "20240101T000000")
    pub date: Option<String>,
    pub filename: String,
    pub track_number: u16,
    /// Duration in milliseconds
    pub duration: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub wave_codec: u32,
    pub bitrate: u32,
    pub bitrate_type: u16,
    pub rating: u16,
    pub use_count: u32,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub filetype: Filetype,
}

impl TrackInfo {
    /// Metadata for sending a local file as a track; the title defaults to the file stem
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self {
            title: path.file_stem().map(|s| s.to_string_lossy().into_owned()),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            filetype: Filetype::from_path(path),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: u32) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_storage(mut self, storage_id: u32) -> Self {
        self.storage_id = storage_id;
        self
    }

    /// "Artist - Title", falling back to the file name
    pub fn display_name(&self) -> String {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => format!("{} - {}", artist, title),
            (None, Some(title)) => title.clone(),
            _ => self.filename.clone(),
        }
    }
}

/// An album: a named, ordered list of track ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumInfo {
    pub id: u32,
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
    pub artist: Option<String>,
    pub composer: Option<String>,
    pub genre: Option<String>,
    pub tracks: Vec<u32>,
}

impl AlbumInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// A playlist: a named, ordered list of track ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub id: u32,
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
    pub tracks: Vec<u32>,
}

impl PlaylistInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Answer of a transfer progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    /// Abort the transfer; the transport reports `TransportError::Cancelled`
    Cancel,
}

/// Transfer progress callback: `(bytes_sent, bytes_total) -> Progress`
pub type ProgressFn<'a> = dyn FnMut(u64, u64) -> Progress + 'a;

/// Operations on an opened device
///
/// These are passed through unchanged by `DeviceSession`, which only adds the
/// closed-session check in front of them.
pub trait DeviceOps: Send {
    /// Manufacturer, model, serial, version and friendly name
    fn identity(&self) -> TransportResult<DeviceIdentity>;

    /// Set the user-visible device name
    fn set_friendly_name(&mut self, name: &str) -> TransportResult<()>;

    /// Name of the application/host the device last synchronised with
    fn sync_partner(&self) -> TransportResult<Option<String>>;

    fn set_sync_partner(&mut self, partner: &str) -> TransportResult<()>;

    fn battery_level(&self) -> TransportResult<BatteryLevel>;

    /// File types the device accepts
    fn supported_filetypes(&self) -> TransportResult<Vec<Filetype>>;

    /// Storages on the device in the requested order
    fn storage(&self, sort: StorageSort) -> TransportResult<Vec<StorageInfo>>;

    /// Every file on the device
    fn files(&self) -> TransportResult<Vec<FileInfo>>;

    /// Metadata for one file
    fn file_info(&self, id: u32) -> TransportResult<FileInfo>;

    /// Every folder on the device, flattened
    fn folders(&self) -> TransportResult<Vec<FolderInfo>>;

    /// Copy object `id` into the local file `dest`, returning the bytes written
    fn get_file(&mut self, id: u32, dest: &Path, progress: &mut ProgressFn<'_>)
        -> TransportResult<u64>;

    /// Send the local file `src` to the device, returning the new object id
    fn send_file(
        &mut self,
        src: &Path,
        file: &NewFile,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32>;

    /// Create a folder, returning its object id
    fn create_folder(&mut self, name: &str, parent_id: u32, storage_id: u32)
        -> TransportResult<u32>;

    /// Delete a file, folder, track or playlist
    fn delete_object(&mut self, id: u32) -> TransportResult<()>;

    /// Reset the device (PTP ResetDevice)
    fn reset(&mut self) -> TransportResult<()>;

    /// Every track on the device
    fn tracks(&self) -> TransportResult<Vec<TrackInfo>>;

    /// Metadata for one track
    fn track(&self, id: u32) -> TransportResult<TrackInfo>;

    fn track_exists(&self, id: u32) -> TransportResult<bool>;

    /// Copy track `id` into the local file `dest`, returning the bytes written
    fn get_track(&mut self, id: u32, dest: &Path, progress: &mut ProgressFn<'_>)
        -> TransportResult<u64>;

    /// Send the local file `src` as a track, returning the new object id
    ///
    /// `track.id`, `size` and `modified` are ignored; the device assigns them.
    fn send_track(
        &mut self,
        src: &Path,
        track: &TrackInfo,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32>;

    /// Rewrite the metadata of the track `track.id`
    fn update_track(&mut self, track: &TrackInfo) -> TransportResult<()>;

    fn albums(&self) -> TransportResult<Vec<AlbumInfo>>;

    fn album(&self, id: u32) -> TransportResult<AlbumInfo>;

    /// Create an album, returning its object id
    fn create_album(&mut self, album: &AlbumInfo) -> TransportResult<u32>;

    /// Rewrite the name, metadata and track list of the album `album.id`
    fn update_album(&mut self, album: &AlbumInfo) -> TransportResult<()>;

    fn playlists(&self) -> TransportResult<Vec<PlaylistInfo>>;

    fn playlist(&self, id: u32) -> TransportResult<PlaylistInfo>;

    /// Create a playlist, returning its object id
    fn create_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<u32>;

    /// Rewrite the name and track list of the playlist `playlist.id`
    fn update_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<()>;

    /// The device's DRM secure clock, as the XML document it returns
    fn secure_time(&self) -> TransportResult<String>;

    /// The device's DRM certificate, as the XML document it returns
    fn certificate(&self) -> TransportResult<String>;

    /// Messages currently on the device's error stack, oldest first
    fn errors(&self) -> TransportResult<Vec<String>>;

    /// Empty the device's error stack
    fn clear_errors(&mut self) -> TransportResult<()>;
}

/// Device discovery and session open/close
///
/// Implementations must be shareable across threads: the session manager may
/// run discovery on a helper thread to enforce a timeout.
pub trait Transport: Send + Sync + 'static {
    /// A discovered device, consumed by `open_session`
    type Raw: RawDevice;

    /// An opened device session
    type Handle: DeviceOps;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "transport"
    }

    /// Enumerate attached devices in the transport's discovery order
    fn list_devices(&self) -> TransportResult<Vec<Self::Raw>>;

    /// Open an exclusive session on a discovered device
    fn open_session(&self, raw: Self::Raw) -> TransportResult<Self::Handle>;

    /// Release a session. Callers treat failures as best-effort.
    fn close_session(&self, handle: Self::Handle) -> TransportResult<()>;

    /// Table of devices the transport knows how to talk to
    fn supported_devices(&self) -> TransportResult<Vec<DeviceEntry>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_entry_display() {
        let entry = DeviceEntry::new("Creative", 0x041e, "ZEN Vision:M", 0x413e);
        assert_eq!(entry.to_string(), "Creative ZEN Vision:M (041e:413e)");

        let anonymous = DeviceEntry::default();
        assert_eq!(
            anonymous.to_string(),
            "Unknown vendor Unknown product (0000:0000)"
        );
    }

    #[test]
    fn test_raw_device_label() {
        let info = RawDeviceInfo {
            entry: DeviceEntry::new("SanDisk", 0x0781, "Sansa e200", 0x7420),
            bus_location: 2,
            devnum: 7,
        };
        assert_eq!(info.label(), "SanDisk Sansa e200 (0781:7420) @ bus 2 dev 7");
    }

    #[test]
    fn test_identity_display_name_fallbacks() {
        let mut identity = DeviceIdentity {
            manufacturer: Some("Creative".to_string()),
            ..Default::default()
        };
        assert_eq!(identity.display_name(), "Creative");

        identity.model = Some("ZEN".to_string());
        assert_eq!(identity.display_name(), "ZEN");

        identity.friendly_name = Some("Gym player".to_string());
        assert_eq!(identity.display_name(), "Gym player");

        assert_eq!(DeviceIdentity::default().display_name(), "Unnamed device");
    }

    #[test]
    fn test_battery_percent() {
        assert_eq!(BatteryLevel { max: 100, current: 42 }.percent(), Some(42));
        assert_eq!(BatteryLevel { max: 4, current: 3 }.percent(), Some(75));
        assert_eq!(BatteryLevel { max: 0, current: 3 }.percent(), None);
        assert_eq!(BatteryLevel { max: 10, current: 20 }.percent(), Some(100));
    }

    #[test]
    fn test_storage_sort() {
        let mut storages = vec![
            StorageInfo {
                id: 1,
                max_capacity: 1_000,
                free_space_bytes: 900,
                ..Default::default()
            },
            StorageInfo {
                id: 2,
                max_capacity: 8_000,
                free_space_bytes: 100,
                ..Default::default()
            },
        ];

        StorageSort::FreeSpace.apply(&mut storages);
        assert_eq!(storages[0].id, 1);

        StorageSort::MaxSpace.apply(&mut storages);
        assert_eq!(storages[0].id, 2);
        assert_eq!(storages[0].used_bytes(), 7_900);

        assert_eq!(StorageSort::NotSorted.code(), 0);
        assert_eq!(StorageSort::MaxSpace.code(), 2);
    }

    #[test]
    fn test_track_from_path() {
        let track = TrackInfo::from_path("/music/02 - Theme.flac").with_parent(3);

        assert_eq!(track.filename, "02 - Theme.flac");
        assert_eq!(track.title.as_deref(), Some("02 - Theme"));
        assert_eq!(track.filetype, Filetype::Flac);
        assert_eq!(track.parent_id, 3);
        assert_eq!(track.display_name(), "02 - Theme");
    }

    #[test]
    fn test_track_display_name() {
        let mut track = TrackInfo {
            filename: "x.mp3".to_string(),
            ..Default::default()
        };
        assert_eq!(track.display_name(), "x.mp3");

        track.title = Some("Intro".to_string());
        track.artist = Some("Band".to_string());
        assert_eq!(track.display_name(), "Band - Intro");
    }

    #[test]
    fn test_new_file_from_path() {
        let file = NewFile::from_path("/music/album/01 - Intro.mp3")
            .with_parent(12)
            .with_storage(0x0001_0001);

        assert_eq!(file.name, "01 - Intro.mp3");
        assert_eq!(file.filetype, Filetype::Mp3);
        assert_eq!(file.parent_id, 12);
        assert_eq!(file.storage_id, 0x0001_0001);
    }
}
