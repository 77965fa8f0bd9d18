//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::device::traits::StorageSort;

/// Inspect and manage MTP media players and phones over USB
#[derive(Parser, Debug)]
#[command(name = "mtp-session")]
#[command(version = "1.0.0")]
#[command(about = "Inspect and manage MTP devices (media players, phones) over USB", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Use a simulated device scenario instead of real hardware
    ///
    /// Run 'mtp-session scenarios' to see what is available.
    #[arg(long, global = true, value_name = "SCENARIO")]
    pub simulate: Option<String>,

    /// Run read-only commands against every attached device
    #[arg(long, global = true)]
    pub all: bool,

    /// Fail on the first device that cannot be opened (overrides config)
    #[arg(long, global = true)]
    pub fail_fast: bool,

    /// Device discovery timeout in seconds, 0 to wait forever (overrides config)
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover attached devices without opening them
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show identity, battery and sync partner
    Info,

    /// Show the storages on the device
    Storage {
        /// Order in which storages are listed
        #[arg(long, value_enum, default_value_t = SortArg::None)]
        sort: SortArg,
    },

    /// List every file on the device
    Files {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// List every folder on the device
    Folders,

    /// Show the file types the device accepts
    Filetypes,

    /// Download a file from the device
    Get {
        /// Object id on the device (see 'files')
        id: u32,

        /// Local destination path
        dest: PathBuf,

        /// Overwrite the destination if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Upload a file to the device
    Send {
        /// Local file to upload
        src: PathBuf,

        /// Destination folder id (0 = storage root)
        #[arg(short, long, default_value_t = 0)]
        parent: u32,

        /// Destination storage id (0 = let the device choose)
        #[arg(short, long, default_value_t = 0)]
        storage: u32,
    },

    /// Create a folder on the device
    Mkdir {
        /// Folder name
        name: String,

        /// Parent folder id (0 = storage root)
        #[arg(short, long, default_value_t = 0)]
        parent: u32,

        /// Storage id (0 = first storage)
        #[arg(short, long, default_value_t = 0)]
        storage: u32,
    },

    /// Delete a file or folder on the device
    Delete {
        /// Object id on the device
        id: u32,
    },

    /// Set the device's friendly name
    Rename {
        /// New friendly name
        name: String,
    },

    /// Set the device's sync partner
    SyncPartner {
        /// New sync partner name
        name: String,
    },

    /// Reset the device (aborts any transaction it has in progress)
    Reset,

    /// List, inspect, transfer and tag tracks
    Track {
        #[command(subcommand)]
        action: TrackCommands,
    },

    /// List, create and extend albums
    Album {
        #[command(subcommand)]
        action: AlbumCommands,
    },

    /// List, create and extend playlists
    Playlist {
        #[command(subcommand)]
        action: PlaylistCommands,
    },

    /// Show the device's DRM secure clock
    SecureTime,

    /// Show the device's DRM certificate
    Certificate,

    /// Show the device's error stack
    Errors {
        /// Empty the stack after printing it
        #[arg(long)]
        clear: bool,
    },

    /// List the devices the transport knows about
    Supported,

    /// List the scenarios available to --simulate
    Scenarios {
        /// Only show scenarios with this tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum TrackCommands {
    /// List every track
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show all metadata of one track
    Show {
        /// Track id on the device
        id: u32,
    },

    /// Download a track
    Get {
        /// Track id on the device
        id: u32,

        /// Local destination path
        dest: PathBuf,

        /// Overwrite the destination if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Upload a local audio file as a track
    Send {
        /// Local file to upload
        src: PathBuf,

        #[command(flatten)]
        tags: TrackTags,

        /// Destination folder id (0 = storage root)
        #[arg(short, long, default_value_t = 0)]
        parent: u32,

        /// Destination storage id (0 = let the device choose)
        #[arg(short, long, default_value_t = 0)]
        storage: u32,
    },

    /// Change the metadata of a track on the device
    Tag {
        /// Track id on the device
        id: u32,

        #[command(flatten)]
        tags: TrackTags,
    },
}

/// Track metadata settable from the command line
#[derive(clap::Args, Debug, Default, Clone)]
pub struct TrackTags {
    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub artist: Option<String>,

    #[arg(long)]
    pub album: Option<String>,

    #[arg(long)]
    pub genre: Option<String>,

    /// Track number on its album
    #[arg(long)]
    pub number: Option<u16>,

    /// Rating, 0 to 100
    #[arg(long, value_parser = clap::value_parser!(u16).range(0..=100))]
    pub rating: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum AlbumCommands {
    /// List every album
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an album and its tracks
    Show {
        /// Album id on the device
        id: u32,
    },

    /// Create an album
    Create {
        /// Album name
        name: String,

        #[arg(long)]
        artist: Option<String>,

        #[arg(long)]
        genre: Option<String>,

        /// Track ids, comma separated
        #[arg(long, value_delimiter = ',')]
        tracks: Vec<u32>,

        /// Parent folder id (0 = storage root)
        #[arg(short, long, default_value_t = 0)]
        parent: u32,

        /// Storage id (0 = first storage)
        #[arg(short, long, default_value_t = 0)]
        storage: u32,
    },

    /// Append tracks to an album
    Add {
        /// Album id on the device
        id: u32,

        /// Track ids to append
        #[arg(required = true)]
        tracks: Vec<u32>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlaylistCommands {
    /// List every playlist
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a playlist and its tracks
    Show {
        /// Playlist id on the device
        id: u32,
    },

    /// Create a playlist
    Create {
        /// Playlist name
        name: String,

        /// Track ids, comma separated
        #[arg(long, value_delimiter = ',')]
        tracks: Vec<u32>,

        /// Parent folder id (0 = storage root)
        #[arg(short, long, default_value_t = 0)]
        parent: u32,

        /// Storage id (0 = first storage)
        #[arg(short, long, default_value_t = 0)]
        storage: u32,
    },

    /// Append tracks to a playlist
    Add {
        /// Playlist id on the device
        id: u32,

        /// Track ids to append
        #[arg(required = true)]
        tracks: Vec<u32>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Print the path of the configuration file in use
    Path,

    /// Write the default configuration file
    ///
    /// The config file is stored at:
    /// - Linux: ~/.config/mtp_session/config.toml
    /// - macOS: ~/Library/Application Support/mtp_session/config.toml
    /// - Windows: %APPDATA%\mtp_session\config.toml
    Init {
        /// Write to this path instead of the standard location
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Storage ordering accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortArg {
    None,
    Free,
    Max,
}

impl From<SortArg> for StorageSort {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::None => StorageSort::NotSorted,
            SortArg::Free => StorageSort::FreeSpace,
            SortArg::Max => StorageSort::MaxSpace,
        }
    }
}
