//! Device interaction module
//!
//! # Submodules
//!
//! - `traits` - Transport abstraction and the data types devices report
//! - `filetype` - MTP file type codes
//! - `libmtp` - Native transport over the system libmtp (feature `libmtp`)
//!
//! # Architecture
//!
//! The session layer only sees the traits in `traits`:
//!
//! - `Transport` - Enumerates devices and opens/closes sessions
//! - `RawDevice` - A discovered device that has not been opened yet
//! - `DeviceOps` - Operations on an opened device
//!
//! Both the native libmtp transport and `testdb::MockTransport` implement
//! them, so everything above works with either.

pub mod filetype;
#[cfg(feature = "libmtp")]
pub mod libmtp;
pub mod traits;

pub use filetype::Filetype;
#[cfg(feature = "libmtp")]
pub use libmtp::LibmtpTransport;
pub use traits::{
    AlbumInfo, BatteryLevel, DeviceEntry, DeviceIdentity, DeviceOps, FileInfo, FolderInfo,
    NewFile, PlaylistInfo, Progress, ProgressFn, RawDevice, RawDeviceInfo, StorageInfo,
    StorageSort, TrackInfo, Transport,
};
