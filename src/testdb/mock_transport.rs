//! Mock transport for running sessions without a real device
//!
//! Each mock device keeps its state (identity, storages, folders, files,
//! media library) in a shared cell, so changes made through one session are visible to the next
//! one. Every transport call is recorded in a [`CallJournal`] that tests use to
//! check open/close accounting.

use crate::core::error::{TransportError, TransportResult};
use crate::device::filetype::Filetype;
use crate::device::traits::{
    AlbumInfo, BatteryLevel, DeviceEntry, DeviceIdentity, DeviceOps, FileInfo, FolderInfo,
    NewFile, PlaylistInfo, Progress, ProgressFn, RawDevice, RawDeviceInfo, StorageInfo,
    StorageSort, TrackInfo, Transport,
};
use chrono::Utc;
use log::{debug, trace};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Bytes moved per progress callback during simulated transfers
const TRANSFER_CHUNK: usize = 64 * 1024;

/// Id of the storage every mock device starts with
pub const DEFAULT_STORAGE_ID: u32 = 0x0001_0001;

/// First object id handed out by a mock device
const FIRST_OBJECT_ID: u32 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A test that panicked mid-call must not hide the journal from the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One call made against a `MockTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// `list_devices`
    List,
    /// Successful `open_session` on device `n`
    Open(usize),
    /// `open_session` on device `n` that returned an error
    OpenFailed(usize),
    /// `close_session` on device `n`, successful or not
    Close(usize),
    /// A `DeviceOps` call on device `n`
    Op(usize, &'static str),
}

/// Ordered record of every call made against a `MockTransport`
#[derive(Debug, Default)]
pub struct CallJournal {
    events: Mutex<Vec<CallEvent>>,
}

impl CallJournal {
    fn record(&self, event: CallEvent) {
        trace!("mock transport: {:?}", event);
        lock(&self.events).push(event);
    }

    fn count(&self, pred: impl Fn(&CallEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(e)).count()
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<CallEvent> {
        lock(&self.events).clone()
    }

    pub fn list_calls(&self) -> usize {
        self.count(|e| matches!(e, CallEvent::List))
    }

    /// Calls to `open_session`, successful or not
    pub fn open_attempts(&self) -> usize {
        self.count(|e| matches!(e, CallEvent::Open(_) | CallEvent::OpenFailed(_)))
    }

    pub fn successful_opens(&self) -> usize {
        self.count(|e| matches!(e, CallEvent::Open(_)))
    }

    pub fn close_calls(&self) -> usize {
        self.count(|e| matches!(e, CallEvent::Close(_)))
    }

    /// Close calls for one device
    pub fn closes_for(&self, device: usize) -> usize {
        self.count(|e| *e == CallEvent::Close(device))
    }

    /// Device operation calls across all devices
    pub fn op_calls(&self) -> usize {
        self.count(|e| matches!(e, CallEvent::Op(..)))
    }
}

/// How opening a mock device fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFault {
    Busy(String),
    PermissionDenied(String),
    Protocol(String),
}

impl OpenFault {
    fn to_error(&self) -> TransportError {
        match self {
            OpenFault::Busy(msg) => TransportError::Busy(msg.clone()),
            OpenFault::PermissionDenied(msg) => TransportError::PermissionDenied(msg.clone()),
            OpenFault::Protocol(msg) => TransportError::Protocol(msg.clone()),
        }
    }
}

/// A file stored on a mock device
#[derive(Debug, Clone)]
pub struct MockFile {
    pub info: FileInfo,
    pub content: Vec<u8>,
    /// Media metadata when the file is a track
    pub track: Option<TrackInfo>,
}

impl MockFile {
    /// The track view of this file; object fields come from `info`
    fn as_track(&self) -> Option<TrackInfo> {
        self.track.as_ref().map(|track| TrackInfo {
            id: self.info.id,
            parent_id: self.info.parent_id,
            storage_id: self.info.storage_id,
            filename: self.info.name.clone(),
            size: self.info.size,
            modified: self.info.modified,
            filetype: self.info.filetype,
            ..track.clone()
        })
    }
}

/// Secure clock document returned by devices built with `with_secure_clock`
const SECURE_TIME_XML: &str =
    "<SecureTime><Date>20240101T120000Z</Date><Counter>1</Counter></SecureTime>";

const CERTIFICATE_XML: &str =
    "<Certificate><Issuer>mock-janus</Issuer><Subject>mock-device</Subject></Certificate>";

/// Description of a simulated device and how it behaves
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub entry: DeviceEntry,
    pub bus_location: u32,
    pub devnum: u8,
    pub identity: DeviceIdentity,
    pub sync_partner: Option<String>,
    pub battery: BatteryLevel,
    pub filetypes: Vec<Filetype>,
    pub storages: Vec<StorageInfo>,
    pub folders: Vec<FolderInfo>,
    pub files: Vec<MockFile>,
    pub albums: Vec<AlbumInfo>,
    pub playlists: Vec<PlaylistInfo>,
    /// DRM secure clock; `None` means the device does not support it
    pub secure_time: Option<String>,
    pub certificate: Option<String>,
    /// Device error stack, oldest first
    pub errors: Vec<String>,
    /// Number of `reset` calls served
    pub resets: u32,
    /// Error returned by `open_session`
    pub open_fault: Option<OpenFault>,
    /// Make `close_session` report an error (the device is still released)
    pub fail_close: bool,
    next_id: u32,
}

impl MockDeviceSpec {
    /// A portable media player with one empty 4 GB storage
    pub fn player(vendor: &str, product: &str) -> Self {
        Self {
            entry: DeviceEntry::new(vendor, 0x041e, product, 0x4150),
            bus_location: 1,
            devnum: 0,
            identity: DeviceIdentity {
                manufacturer: Some(vendor.to_string()),
                model: Some(product.to_string()),
                serial_number: Some(format!("{}-{}-0001", vendor, product).replace(' ', "")),
                version: Some("1.0.0".to_string()),
                friendly_name: None,
            },
            sync_partner: None,
            battery: BatteryLevel { max: 100, current: 80 },
            filetypes: vec![
                Filetype::Mp3,
                Filetype::Wma,
                Filetype::Wav,
                Filetype::Jpeg,
                Filetype::Playlist,
                Filetype::Album,
            ],
            storages: vec![StorageInfo {
                id: DEFAULT_STORAGE_ID,
                storage_type: 0x0003,
                filesystem_type: 0x0002,
                access_capability: 0,
                max_capacity: 4 * 1024 * 1024 * 1024,
                free_space_bytes: 4 * 1024 * 1024 * 1024,
                free_space_objects: 0xFFFF_FFFF,
                description: Some("Internal Storage".to_string()),
                volume_id: None,
            }],
            folders: Vec::new(),
            files: Vec::new(),
            albums: Vec::new(),
            playlists: Vec::new(),
            secure_time: None,
            certificate: None,
            errors: Vec::new(),
            resets: 0,
            open_fault: None,
            fail_close: false,
            next_id: FIRST_OBJECT_ID,
        }
    }

    /// Opening fails with `TransportError::Busy(msg)`
    pub fn busy(mut self, msg: &str) -> Self {
        self.open_fault = Some(OpenFault::Busy(msg.to_string()));
        self
    }

    pub fn permission_denied(mut self, msg: &str) -> Self {
        self.open_fault = Some(OpenFault::PermissionDenied(msg.to_string()));
        self
    }

    pub fn protocol_error(mut self, msg: &str) -> Self {
        self.open_fault = Some(OpenFault::Protocol(msg.to_string()));
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_friendly_name(mut self, name: &str) -> Self {
        self.identity.friendly_name = Some(name.to_string());
        self
    }

    pub fn with_battery(mut self, current: u8, max: u8) -> Self {
        self.battery = BatteryLevel { max, current };
        self
    }

    pub fn at(mut self, bus_location: u32, devnum: u8) -> Self {
        self.bus_location = bus_location;
        self.devnum = devnum;
        self
    }

    /// Add a storage; space is given in bytes
    pub fn with_storage(mut self, id: u32, description: &str, max: u64, free: u64) -> Self {
        self.storages.push(StorageInfo {
            id,
            storage_type: 0x0004,
            filesystem_type: 0x0002,
            access_capability: 0,
            max_capacity: max,
            free_space_bytes: free,
            free_space_objects: 0xFFFF_FFFF,
            description: Some(description.to_string()),
            volume_id: None,
        });
        self
    }

    /// Add a folder at the root of the first storage
    pub fn with_folder(mut self, name: &str) -> Self {
        let id = self.allocate_id();
        let storage_id = self.default_storage();
        self.folders.push(FolderInfo {
            id,
            parent_id: 0,
            storage_id,
            name: name.to_string(),
        });
        self
    }

    /// Add a file at the root of the first storage
    pub fn with_file(mut self, name: &str, content: Vec<u8>) -> Self {
        let id = self.allocate_id();
        let storage_id = self.default_storage();
        self.files.push(MockFile {
            info: FileInfo {
                id,
                parent_id: 0,
                storage_id,
                name: name.to_string(),
                size: content.len() as u64,
                modified: Some(Utc::now()),
                filetype: Filetype::from_path(name),
            },
            content,
            track: None,
        });
        self
    }

    /// Add a track at the root of the first storage
    pub fn with_track(mut self, filename: &str, title: &str, artist: &str, content: Vec<u8>) -> Self {
        self = self.with_file(filename, content);
        if let Some(file) = self.files.last_mut() {
            file.track = Some(TrackInfo {
                title: Some(title.to_string()),
                artist: Some(artist.to_string()),
                ..TrackInfo::default()
            });
        }
        self
    }

    /// Add an album holding the tracks named `filenames`
    pub fn with_album(mut self, name: &str, filenames: &[&str]) -> Self {
        let id = self.allocate_id();
        let storage_id = self.default_storage();
        let tracks = self.track_ids(filenames);
        self.albums.push(AlbumInfo {
            id,
            storage_id,
            tracks,
            ..AlbumInfo::new(name)
        });
        self
    }

    pub fn with_playlist(mut self, name: &str, filenames: &[&str]) -> Self {
        let id = self.allocate_id();
        let storage_id = self.default_storage();
        let tracks = self.track_ids(filenames);
        self.playlists.push(PlaylistInfo {
            id,
            storage_id,
            tracks,
            ..PlaylistInfo::new(name)
        });
        self
    }

    /// Give the device a DRM secure clock and certificate
    pub fn with_secure_clock(mut self) -> Self {
        self.secure_time = Some(SECURE_TIME_XML.to_string());
        self.certificate = Some(CERTIFICATE_XML.to_string());
        self
    }

    /// Seed the device error stack
    pub fn with_error(mut self, msg: &str) -> Self {
        self.errors.push(msg.to_string());
        self
    }

    fn track_ids(&self, filenames: &[&str]) -> Vec<u32> {
        filenames
            .iter()
            .filter_map(|name| {
                self.files
                    .iter()
                    .find(|f| f.track.is_some() && f.info.name == *name)
                    .map(|f| f.info.id)
            })
            .collect()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn default_storage(&self) -> u32 {
        self.storages.first().map(|s| s.id).unwrap_or(0)
    }

    fn raw_info(&self) -> RawDeviceInfo {
        RawDeviceInfo {
            entry: self.entry.clone(),
            bus_location: self.bus_location,
            devnum: self.devnum,
        }
    }
}

/// Per-device state shared by every session opened on it
#[derive(Debug)]
struct MockDeviceState {
    spec: MockDeviceSpec,
    /// Set while a session holds the device
    open: bool,
}

impl MockDeviceState {
    /// Push `err` onto the device error stack and hand it back
    fn fail(&mut self, err: TransportError) -> TransportError {
        self.spec.errors.push(err.to_string());
        err
    }

    fn file(&mut self, id: u32) -> TransportResult<&MockFile> {
        match self.spec.files.iter().position(|f| f.info.id == id) {
            Some(pos) => Ok(&self.spec.files[pos]),
            None => Err(self.fail(TransportError::NotFound(id))),
        }
    }

    fn track(&mut self, id: u32) -> TransportResult<TrackInfo> {
        let found = self
            .spec
            .files
            .iter()
            .find(|f| f.info.id == id)
            .and_then(MockFile::as_track);
        found.ok_or_else(|| self.fail(TransportError::NotFound(id)))
    }

    /// Every id in `tracks` must name a track on the device
    fn check_tracks(&mut self, tracks: &[u32]) -> TransportResult<()> {
        let missing = tracks.iter().copied().find(|id| {
            !self
                .spec
                .files
                .iter()
                .any(|f| f.info.id == *id && f.track.is_some())
        });
        match missing {
            Some(id) => Err(self.fail(TransportError::NotFound(id))),
            None => Ok(()),
        }
    }

    fn check_parent(&mut self, parent_id: u32) -> TransportResult<()> {
        if parent_id != 0 && !self.spec.folders.iter().any(|f| f.id == parent_id) {
            return Err(self.fail(TransportError::NotFound(parent_id)));
        }
        Ok(())
    }

    /// Drop a deleted track from every album and playlist
    fn unlink_track(&mut self, id: u32) {
        for album in &mut self.spec.albums {
            album.tracks.retain(|t| *t != id);
        }
        for playlist in &mut self.spec.playlists {
            playlist.tracks.retain(|t| *t != id);
        }
    }
}

type SharedState = Arc<Mutex<MockDeviceState>>;

/// A mock device returned by discovery
#[derive(Debug)]
pub struct MockRawDevice {
    index: usize,
    info: RawDeviceInfo,
    state: SharedState,
}

impl RawDevice for MockRawDevice {
    fn info(&self) -> RawDeviceInfo {
        self.info.clone()
    }
}

/// An open session on a mock device
#[derive(Debug)]
pub struct MockHandle {
    index: usize,
    state: SharedState,
    journal: Arc<CallJournal>,
}

impl MockHandle {
    fn state(&self, op: &'static str) -> MutexGuard<'_, MockDeviceState> {
        self.journal.record(CallEvent::Op(self.index, op));
        lock(&self.state)
    }

    /// Write `content` to `dest` in chunks; a cancelled copy leaves no file behind
    fn download(
        &self,
        id: u32,
        content: Vec<u8>,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u64> {
        let total = content.len() as u64;
        let mut out = File::create(dest)?;
        let mut sent = 0u64;

        if content.is_empty() && progress(0, 0) == Progress::Cancel {
            drop(out);
            let _ = fs::remove_file(dest);
            return Err(TransportError::Cancelled);
        }

        for chunk in content.chunks(TRANSFER_CHUNK) {
            out.write_all(chunk)?;
            sent += chunk.len() as u64;
            if progress(sent, total) == Progress::Cancel {
                drop(out);
                let _ = fs::remove_file(dest);
                return Err(TransportError::Cancelled);
            }
        }

        out.flush()?;
        debug!("mock device #{}: sent object {} ({} bytes)", self.index, id, total);
        Ok(total)
    }

    /// Store `src` as a new object, charging its size to the target storage
    fn upload(
        &mut self,
        op: &'static str,
        src: &Path,
        file: &NewFile,
        track: Option<TrackInfo>,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32> {
        let content = fs::read(src)?;
        let total = content.len() as u64;

        let mut state = self.state(op);
        let storage_id = resolve_storage(&state.spec, file.storage_id)?;
        state.check_parent(file.parent_id)?;

        let free = state
            .spec
            .storages
            .iter()
            .find(|s| s.id == storage_id)
            .map(|s| s.free_space_bytes)
            .unwrap_or(0);
        if total > free {
            return Err(state.fail(TransportError::Protocol("storage full".to_string())));
        }

        let mut sent = 0u64;
        if content.is_empty() && progress(0, 0) == Progress::Cancel {
            return Err(TransportError::Cancelled);
        }
        for chunk in content.chunks(TRANSFER_CHUNK) {
            sent += chunk.len() as u64;
            if progress(sent, total) == Progress::Cancel {
                return Err(TransportError::Cancelled);
            }
        }

        let id = state.spec.allocate_id();
        if let Some(storage) = state.spec.storages.iter_mut().find(|s| s.id == storage_id) {
            storage.free_space_bytes -= total;
        }
        state.spec.files.push(MockFile {
            info: FileInfo {
                id,
                parent_id: file.parent_id,
                storage_id,
                name: file.name.clone(),
                size: total,
                modified: Some(Utc::now()),
                filetype: file.filetype,
            },
            content,
            track,
        });

        Ok(id)
    }
}

impl DeviceOps for MockHandle {
    fn identity(&self) -> TransportResult<DeviceIdentity> {
        Ok(self.state("identity").spec.identity.clone())
    }

    fn set_friendly_name(&mut self, name: &str) -> TransportResult<()> {
        self.state("set_friendly_name").spec.identity.friendly_name = Some(name.to_string());
        Ok(())
    }

    fn sync_partner(&self) -> TransportResult<Option<String>> {
        Ok(self.state("sync_partner").spec.sync_partner.clone())
    }

    fn set_sync_partner(&mut self, partner: &str) -> TransportResult<()> {
        self.state("set_sync_partner").spec.sync_partner = Some(partner.to_string());
        Ok(())
    }

    fn battery_level(&self) -> TransportResult<BatteryLevel> {
        Ok(self.state("battery_level").spec.battery)
    }

    fn supported_filetypes(&self) -> TransportResult<Vec<Filetype>> {
        Ok(self.state("supported_filetypes").spec.filetypes.clone())
    }

    fn storage(&self, sort: StorageSort) -> TransportResult<Vec<StorageInfo>> {
        let mut storages = self.state("storage").spec.storages.clone();
        sort.apply(&mut storages);
        Ok(storages)
    }

    fn files(&self) -> TransportResult<Vec<FileInfo>> {
        let state = self.state("files");
        Ok(state.spec.files.iter().map(|f| f.info.clone()).collect())
    }

    fn file_info(&self, id: u32) -> TransportResult<FileInfo> {
        let mut state = self.state("file_info");
        Ok(state.file(id)?.info.clone())
    }

    fn folders(&self) -> TransportResult<Vec<FolderInfo>> {
        Ok(self.state("folders").spec.folders.clone())
    }

    fn get_file(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u64> {
        let content = self.state("get_file").file(id)?.content.clone();
        self.download(id, content, dest, progress)
    }

    fn send_file(
        &mut self,
        src: &Path,
        file: &NewFile,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32> {
        self.upload("send_file", src, file, None, progress)
    }

    fn create_folder(
        &mut self,
        name: &str,
        parent_id: u32,
        storage_id: u32,
    ) -> TransportResult<u32> {
        let mut state = self.state("create_folder");
        let storage_id = resolve_storage(&state.spec, storage_id)?;
        state.check_parent(parent_id)?;

        let id = state.spec.allocate_id();
        state.spec.folders.push(FolderInfo {
            id,
            parent_id,
            storage_id,
            name: name.to_string(),
        });
        Ok(id)
    }

    fn delete_object(&mut self, id: u32) -> TransportResult<()> {
        let mut state = self.state("delete_object");

        if let Some(pos) = state.spec.files.iter().position(|f| f.info.id == id) {
            let removed = state.spec.files.remove(pos);
            let storage_id = removed.info.storage_id;
            if let Some(storage) = state.spec.storages.iter_mut().find(|s| s.id == storage_id) {
                storage.free_space_bytes += removed.info.size;
            }
            state.unlink_track(id);
            return Ok(());
        }

        if let Some(pos) = state.spec.folders.iter().position(|f| f.id == id) {
            let occupied = state.spec.files.iter().any(|f| f.info.parent_id == id)
                || state.spec.folders.iter().any(|f| f.parent_id == id);
            if occupied {
                let err = TransportError::Protocol(format!("folder {} is not empty", id));
                return Err(state.fail(err));
            }
            state.spec.folders.remove(pos);
            return Ok(());
        }

        if let Some(pos) = state.spec.albums.iter().position(|a| a.id == id) {
            state.spec.albums.remove(pos);
            return Ok(());
        }
        if let Some(pos) = state.spec.playlists.iter().position(|p| p.id == id) {
            state.spec.playlists.remove(pos);
            return Ok(());
        }

        Err(state.fail(TransportError::NotFound(id)))
    }

    /// A reset aborts any device-side transaction, which also empties the error stack
    fn reset(&mut self) -> TransportResult<()> {
        let mut state = self.state("reset");
        state.spec.resets += 1;
        state.spec.errors.clear();
        Ok(())
    }

    fn tracks(&self) -> TransportResult<Vec<TrackInfo>> {
        let state = self.state("tracks");
        Ok(state.spec.files.iter().filter_map(MockFile::as_track).collect())
    }

    fn track(&self, id: u32) -> TransportResult<TrackInfo> {
        self.state("track").track(id)
    }

    fn track_exists(&self, id: u32) -> TransportResult<bool> {
        let state = self.state("track_exists");
        Ok(state
            .spec
            .files
            .iter()
            .any(|f| f.info.id == id && f.track.is_some()))
    }

    fn get_track(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u64> {
        let content = {
            let mut state = self.state("get_track");
            state.track(id)?;
            state.file(id)?.content.clone()
        };
        self.download(id, content, dest, progress)
    }

    fn send_track(
        &mut self,
        src: &Path,
        track: &TrackInfo,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32> {
        let file = NewFile {
            name: track.filename.clone(),
            parent_id: track.parent_id,
            storage_id: track.storage_id,
            filetype: track.filetype,
        };
        self.upload("send_track", src, &file, Some(track.clone()), progress)
    }

    fn update_track(&mut self, track: &TrackInfo) -> TransportResult<()> {
        let mut state = self.state("update_track");
        state.track(track.id)?;
        if let Some(file) = state.spec.files.iter_mut().find(|f| f.info.id == track.id) {
            file.track = Some(track.clone());
        }
        Ok(())
    }

    fn albums(&self) -> TransportResult<Vec<AlbumInfo>> {
        Ok(self.state("albums").spec.albums.clone())
    }

    fn album(&self, id: u32) -> TransportResult<AlbumInfo> {
        let mut state = self.state("album");
        let found = state.spec.albums.iter().find(|a| a.id == id).cloned();
        found.ok_or_else(|| state.fail(TransportError::NotFound(id)))
    }

    fn create_album(&mut self, album: &AlbumInfo) -> TransportResult<u32> {
        let mut state = self.state("create_album");
        let storage_id = resolve_storage(&state.spec, album.storage_id)?;
        state.check_parent(album.parent_id)?;
        state.check_tracks(&album.tracks)?;

        let id = state.spec.allocate_id();
        state.spec.albums.push(AlbumInfo {
            id,
            storage_id,
            ..album.clone()
        });
        Ok(id)
    }

    fn update_album(&mut self, album: &AlbumInfo) -> TransportResult<()> {
        let mut state = self.state("update_album");
        state.check_tracks(&album.tracks)?;
        let Some(pos) = state.spec.albums.iter().position(|a| a.id == album.id) else {
            return Err(state.fail(TransportError::NotFound(album.id)));
        };

        let existing = &mut state.spec.albums[pos];
        *existing = AlbumInfo {
            parent_id: existing.parent_id,
            storage_id: existing.storage_id,
            ..album.clone()
        };
        Ok(())
    }

    fn playlists(&self) -> TransportResult<Vec<PlaylistInfo>> {
        Ok(self.state("playlists").spec.playlists.clone())
    }

    fn playlist(&self, id: u32) -> TransportResult<PlaylistInfo> {
        let mut state = self.state("playlist");
        let found = state.spec.playlists.iter().find(|p| p.id == id).cloned();
        found.ok_or_else(|| state.fail(TransportError::NotFound(id)))
    }

    fn create_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<u32> {
        let mut state = self.state("create_playlist");
        let storage_id = resolve_storage(&state.spec, playlist.storage_id)?;
        state.check_parent(playlist.parent_id)?;
        state.check_tracks(&playlist.tracks)?;

        let id = state.spec.allocate_id();
        state.spec.playlists.push(PlaylistInfo {
            id,
            storage_id,
            ..playlist.clone()
        });
        Ok(id)
    }

    fn update_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<()> {
        let mut state = self.state("update_playlist");
        state.check_tracks(&playlist.tracks)?;
        let Some(pos) = state.spec.playlists.iter().position(|p| p.id == playlist.id) else {
            return Err(state.fail(TransportError::NotFound(playlist.id)));
        };

        let existing = &mut state.spec.playlists[pos];
        *existing = PlaylistInfo {
            parent_id: existing.parent_id,
            storage_id: existing.storage_id,
            ..playlist.clone()
        };
        Ok(())
    }

    fn secure_time(&self) -> TransportResult<String> {
        let mut state = self.state("secure_time");
        match state.spec.secure_time.clone() {
            Some(xml) => Ok(xml),
            None => Err(state.fail(TransportError::Protocol(
                "device does not support a secure clock".to_string(),
            ))),
        }
    }

    fn certificate(&self) -> TransportResult<String> {
        let mut state = self.state("certificate");
        match state.spec.certificate.clone() {
            Some(xml) => Ok(xml),
            None => Err(state.fail(TransportError::Protocol(
                "device has no DRM certificate".to_string(),
            ))),
        }
    }

    fn errors(&self) -> TransportResult<Vec<String>> {
        Ok(self.state("errors").spec.errors.clone())
    }

    fn clear_errors(&mut self) -> TransportResult<()> {
        self.state("clear_errors").spec.errors.clear();
        Ok(())
    }
}

/// Storage id 0 means "let the device choose": the first storage
fn resolve_storage(spec: &MockDeviceSpec, requested: u32) -> TransportResult<u32> {
    if requested == 0 {
        return spec
            .storages
            .first()
            .map(|s| s.id)
            .ok_or_else(|| TransportError::Protocol("device has no storage".to_string()));
    }
    if spec.storages.iter().any(|s| s.id == requested) {
        Ok(requested)
    } else {
        Err(TransportError::NotFound(requested))
    }
}

/// In-memory transport over a fixed set of mock devices
#[derive(Debug)]
pub struct MockTransport {
    devices: Vec<SharedState>,
    journal: Arc<CallJournal>,
    /// Discovery fails with `Unavailable` when set
    unavailable: Option<String>,
    discovery_delay: Option<Duration>,
}

impl MockTransport {
    /// A transport with nothing attached
    pub fn new() -> Self {
        Self::with_devices(Vec::new())
    }

    /// Devices are discovered in the order given
    pub fn with_devices(specs: Vec<MockDeviceSpec>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| Arc::new(Mutex::new(MockDeviceState { spec, open: false })))
            .collect();

        Self {
            devices,
            journal: Arc::new(CallJournal::default()),
            unavailable: None,
            discovery_delay: None,
        }
    }

    /// A transport whose USB layer cannot be initialised
    pub fn unavailable(msg: &str) -> Self {
        let mut transport = Self::new();
        transport.unavailable = Some(msg.to_string());
        transport
    }

    /// Make `list_devices` block for `delay` before answering
    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = Some(delay);
        self
    }

    pub fn journal(&self) -> Arc<CallJournal> {
        Arc::clone(&self.journal)
    }

    /// Resets served by device `index` across all its sessions
    pub fn reset_count(&self, index: usize) -> u32 {
        self.devices
            .get(index)
            .map(|d| lock(d).spec.resets)
            .unwrap_or(0)
    }

    /// True while a session holds device `index`
    pub fn is_open(&self, index: usize) -> bool {
        self.devices
            .get(index)
            .map(|d| lock(d).open)
            .unwrap_or(false)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    type Raw = MockRawDevice;
    type Handle = MockHandle;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_devices(&self) -> TransportResult<Vec<MockRawDevice>> {
        self.journal.record(CallEvent::List);

        if let Some(delay) = self.discovery_delay {
            thread::sleep(delay);
        }
        if let Some(msg) = &self.unavailable {
            return Err(TransportError::Unavailable(msg.clone()));
        }

        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(index, state)| MockRawDevice {
                index,
                info: lock(state).spec.raw_info(),
                state: Arc::clone(state),
            })
            .collect())
    }

    fn open_session(&self, raw: MockRawDevice) -> TransportResult<MockHandle> {
        let mut state = lock(&raw.state);

        let fault = if state.open {
            Some(TransportError::Busy("device already has an open session".to_string()))
        } else {
            state.spec.open_fault.as_ref().map(OpenFault::to_error)
        };

        if let Some(err) = fault {
            self.journal.record(CallEvent::OpenFailed(raw.index));
            return Err(err);
        }

        state.open = true;
        drop(state);
        self.journal.record(CallEvent::Open(raw.index));

        Ok(MockHandle {
            index: raw.index,
            state: raw.state,
            journal: Arc::clone(&self.journal),
        })
    }

    fn close_session(&self, handle: MockHandle) -> TransportResult<()> {
        self.journal.record(CallEvent::Close(handle.index));

        let mut state = lock(&handle.state);
        state.open = false;
        if state.spec.fail_close {
            return Err(TransportError::Protocol(
                "PTP CloseSession returned an error".to_string(),
            ));
        }
        Ok(())
    }

    fn supported_devices(&self) -> TransportResult<Vec<DeviceEntry>> {
        let mut entries: Vec<DeviceEntry> =
            self.devices.iter().map(|d| lock(d).spec.entry.clone()).collect();
        entries.dedup();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_only(transport: &MockTransport) -> MockHandle {
        let raw = transport.list_devices().unwrap().remove(0);
        transport.open_session(raw).unwrap()
    }

    #[test]
    fn test_discovery_order_and_labels() {
        let transport = MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").at(1, 4),
            MockDeviceSpec::player("SanDisk", "Sansa").at(2, 7),
        ]);

        let devices = transport.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].info().label().starts_with("Creative ZEN"));
        assert!(devices[0].info().label().ends_with("@ bus 1 dev 4"));
        assert_eq!(devices[1].info().entry.product.as_deref(), Some("Sansa"));
        assert_eq!(transport.journal().list_calls(), 1);
    }

    #[test]
    fn test_unavailable_transport() {
        let transport = MockTransport::unavailable("no USB");
        assert!(matches!(
            transport.list_devices(),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn test_second_open_is_busy_until_closed() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);

        let handle = open_only(&transport);
        assert!(transport.is_open(0));

        let raw = transport.list_devices().unwrap().remove(0);
        assert!(matches!(transport.open_session(raw), Err(TransportError::Busy(_))));

        transport.close_session(handle).unwrap();
        assert!(!transport.is_open(0));

        let handle = open_only(&transport);
        transport.close_session(handle).unwrap();

        let journal = transport.journal();
        assert_eq!(journal.open_attempts(), 3);
        assert_eq!(journal.successful_opens(), 2);
        assert_eq!(journal.close_calls(), 2);
    }

    #[test]
    fn test_failing_close_still_releases() {
        let transport = MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").failing_close(),
        ]);

        let handle = open_only(&transport);
        assert!(transport.close_session(handle).is_err());
        assert!(!transport.is_open(0));
    }

    #[test]
    fn test_state_persists_across_sessions() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);

        let mut handle = open_only(&transport);
        handle.set_sync_partner("desktop").unwrap();
        let folder = handle.create_folder("Music", 0, 0).unwrap();
        transport.close_session(handle).unwrap();

        let handle = open_only(&transport);
        assert_eq!(handle.sync_partner().unwrap().as_deref(), Some("desktop"));
        let folders = handle.folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, folder);
        assert_eq!(folders[0].storage_id, DEFAULT_STORAGE_ID);
    }

    #[test]
    fn test_get_file_reports_progress() {
        let content = vec![7u8; TRANSFER_CHUNK * 2 + 10];
        let transport = MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").with_file("big.wav", content.clone()),
        ]);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("big.wav");

        let mut handle = open_only(&transport);
        let id = handle.files().unwrap()[0].id;

        let mut calls = Vec::new();
        let written = handle
            .get_file(id, &dest, &mut |sent, total| {
                calls.push((sent, total));
                Progress::Continue
            })
            .unwrap();

        assert_eq!(written, content.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), content);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.last(), Some(&(written, written)));
    }

    #[test]
    fn test_get_file_cancel_removes_partial_file() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_file("big.wav", vec![0u8; TRANSFER_CHUNK * 3])]);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("big.wav");

        let mut handle = open_only(&transport);
        let id = handle.files().unwrap()[0].id;

        let result = handle.get_file(id, &dest, &mut |_, _| Progress::Cancel);
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_get_missing_file() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let dir = tempdir().unwrap();

        let mut handle = open_only(&transport);
        let result = handle.get_file(42, &dir.path().join("x"), &mut |_, _| Progress::Continue);
        assert!(matches!(result, Err(TransportError::NotFound(42))));
    }

    #[test]
    fn test_send_file_updates_listing_and_free_space() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let dir = tempdir().unwrap();
        let src = dir.path().join("track.mp3");
        fs::write(&src, vec![1u8; 1000]).unwrap();

        let mut handle = open_only(&transport);
        let free_before = handle.storage(StorageSort::NotSorted).unwrap()[0].free_space_bytes;

        let id = handle
            .send_file(&src, &NewFile::from_path(&src), &mut |_, _| Progress::Continue)
            .unwrap();

        let info = handle.file_info(id).unwrap();
        assert_eq!(info.name, "track.mp3");
        assert_eq!(info.size, 1000);
        assert_eq!(info.filetype, Filetype::Mp3);

        let free_after = handle.storage(StorageSort::NotSorted).unwrap()[0].free_space_bytes;
        assert_eq!(free_before - free_after, 1000);
    }

    #[test]
    fn test_send_file_to_missing_folder() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello").unwrap();

        let mut handle = open_only(&transport);
        let file = NewFile::from_path(&src).with_parent(999);
        let result = handle.send_file(&src, &file, &mut |_, _| Progress::Continue);
        assert!(matches!(result, Err(TransportError::NotFound(999))));
    }

    #[test]
    fn test_delete_non_empty_folder_fails() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let mut handle = open_only(&transport);

        let parent = handle.create_folder("Music", 0, 0).unwrap();
        let child = handle.create_folder("Albums", parent, 0).unwrap();

        assert!(matches!(
            handle.delete_object(parent),
            Err(TransportError::Protocol(_))
        ));
        handle.delete_object(child).unwrap();
        handle.delete_object(parent).unwrap();
        assert!(handle.folders().unwrap().is_empty());
        assert!(matches!(handle.delete_object(parent), Err(TransportError::NotFound(_))));
    }

    #[test]
    fn test_storage_sorting() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_storage(0x0002_0001, "SD card", 64 * 1024 * 1024 * 1024, 100)]);
        let handle = open_only(&transport);

        let by_max = handle.storage(StorageSort::MaxSpace).unwrap();
        assert_eq!(by_max[0].description.as_deref(), Some("SD card"));

        let by_free = handle.storage(StorageSort::FreeSpace).unwrap();
        assert_eq!(by_free[0].id, DEFAULT_STORAGE_ID);
    }

    #[test]
    fn test_failed_ops_fill_error_stack() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let mut handle = open_only(&transport);

        assert!(handle.file_info(42).is_err());
        assert!(handle.secure_time().is_err());
        let errors = handle.errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("42"));

        // Reading the stack leaves it in place
        assert_eq!(handle.errors().unwrap().len(), 2);

        handle.clear_errors().unwrap();
        assert!(handle.errors().unwrap().is_empty());
    }

    #[test]
    fn test_reset_counts_and_clears_errors() {
        let transport = MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").with_error("stale transaction"),
        ]);
        let mut handle = open_only(&transport);

        handle.reset().unwrap();
        handle.reset().unwrap();

        assert_eq!(transport.reset_count(0), 2);
        assert_eq!(transport.reset_count(5), 0);
        assert!(handle.errors().unwrap().is_empty());
    }

    #[test]
    fn test_tracks_are_files_with_metadata() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_track("intro.mp3", "Intro", "Band", b"ID3 intro".to_vec())
            .with_file("cover.jpg", vec![0xFF, 0xD8])]);
        let handle = open_only(&transport);

        let files = handle.files().unwrap();
        assert_eq!(files.len(), 2);

        let tracks = handle.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, files[0].id);
        assert_eq!(tracks[0].filename, "intro.mp3");
        assert_eq!(tracks[0].size, 9);
        assert_eq!(tracks[0].display_name(), "Band - Intro");

        assert!(handle.track_exists(files[0].id).unwrap());
        assert!(!handle.track_exists(files[1].id).unwrap());
        assert!(matches!(handle.track(files[1].id), Err(TransportError::NotFound(_))));
    }

    #[test]
    fn test_send_and_get_track() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let dir = tempdir().unwrap();
        let src = dir.path().join("song.mp3");
        fs::write(&src, b"ID3 song").unwrap();

        let mut handle = open_only(&transport);
        let mut track = TrackInfo::from_path(&src);
        track.artist = Some("Band".to_string());
        let id = handle
            .send_track(&src, &track, &mut |_, _| Progress::Continue)
            .unwrap();

        let stored = handle.track(id).unwrap();
        assert_eq!(stored.artist.as_deref(), Some("Band"));
        assert_eq!(stored.size, 8);

        let dest = dir.path().join("copy.mp3");
        let written = handle
            .get_track(id, &dest, &mut |_, _| Progress::Continue)
            .unwrap();
        assert_eq!(written, 8);
        assert_eq!(fs::read(&dest).unwrap(), b"ID3 song");
    }

    #[test]
    fn test_album_requires_existing_tracks() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())]);
        let mut handle = open_only(&transport);
        let track_id = handle.tracks().unwrap()[0].id;

        let mut album = AlbumInfo::new("Debut");
        album.tracks = vec![track_id, 999];
        assert!(matches!(
            handle.create_album(&album),
            Err(TransportError::NotFound(999))
        ));

        album.tracks = vec![track_id];
        let id = handle.create_album(&album).unwrap();
        let stored = handle.album(id).unwrap();
        assert_eq!(stored.storage_id, DEFAULT_STORAGE_ID);
        assert_eq!(stored.tracks, vec![track_id]);
    }

    #[test]
    fn test_deleting_track_unlinks_it() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())
            .with_track("theme.mp3", "Theme", "Band", b"ID3".to_vec())
            .with_album("Debut", &["intro.mp3", "theme.mp3"])
            .with_playlist("Morning", &["theme.mp3"])]);
        let mut handle = open_only(&transport);

        let theme = handle.tracks().unwrap()[1].id;
        handle.delete_object(theme).unwrap();

        assert_eq!(handle.albums().unwrap()[0].tracks.len(), 1);
        assert!(handle.playlists().unwrap()[0].tracks.is_empty());
    }

    #[test]
    fn test_update_playlist_keeps_location() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")
            .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())
            .with_playlist("Morning", &[])]);
        let mut handle = open_only(&transport);

        let mut playlist = handle.playlists().unwrap().remove(0);
        let track = handle.tracks().unwrap()[0].id;
        playlist.name = "Evening".to_string();
        playlist.storage_id = 0x9999;
        playlist.tracks.push(track);
        handle.update_playlist(&playlist).unwrap();

        let stored = handle.playlist(playlist.id).unwrap();
        assert_eq!(stored.name, "Evening");
        assert_eq!(stored.storage_id, DEFAULT_STORAGE_ID);
        assert_eq!(stored.tracks, vec![track]);

        playlist.id = 4242;
        assert!(matches!(
            handle.update_playlist(&playlist),
            Err(TransportError::NotFound(4242))
        ));
    }

    #[test]
    fn test_ops_are_journaled() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let handle = open_only(&transport);

        handle.identity().unwrap();
        handle.battery_level().unwrap();

        let journal = transport.journal();
        assert_eq!(journal.op_calls(), 2);
        assert!(journal.events().contains(&CallEvent::Op(0, "battery_level")));
    }
}
