//! A single exclusive session on one device
//!
//! `DeviceSession` owns the transport handle for its whole lifetime. The
//! handle is released exactly once: by the first `close()`, or by `Drop` if
//! the session is still open when it goes out of scope.

use crate::core::error::{Result, SessionError, TransportError};
use crate::device::filetype::Filetype;
use crate::device::traits::{
    AlbumInfo, BatteryLevel, DeviceIdentity, DeviceOps, FileInfo, FolderInfo, NewFile,
    PlaylistInfo, ProgressFn, RawDevice, StorageInfo, StorageSort, TrackInfo, Transport,
};
use log::{debug, warn};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// An open (or closed) session on one device
pub struct DeviceSession<T: Transport> {
    transport: Arc<T>,
    /// `None` once the session has been closed
    handle: Option<T::Handle>,
    index: usize,
    label: String,
}

impl<T: Transport> DeviceSession<T> {
    /// Open a session on a discovered device
    ///
    /// `index` is the device's position in discovery order. On failure the
    /// transport error is returned unchanged and nothing is retained.
    pub fn open(
        transport: Arc<T>,
        raw: T::Raw,
        index: usize,
    ) -> std::result::Result<Self, TransportError> {
        let label = raw.info().label();
        debug!("Opening session on {} via {}", label, transport.name());

        let handle = transport.open_session(raw)?;

        debug!("Session #{} open: {}", index, label);
        Ok(Self {
            transport,
            handle: Some(handle),
            index,
            label,
        })
    }

    /// Release the device. Safe to call any number of times.
    ///
    /// Close errors from the transport are logged and dropped: by the time a
    /// session is closed nobody can act on them.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        debug!("Closing session #{}: {}", self.index, self.label);
        if let Err(e) = self.transport.close_session(handle) {
            warn!(
                "Failed to close session #{} ({}): {}",
                self.index, self.label, e
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Position of the device in discovery order
    pub fn index(&self) -> usize {
        self.index
    }

    /// Description of the device captured at discovery time
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The underlying handle, for transport-specific operations
    pub fn device(&self) -> Result<&T::Handle> {
        self.handle.as_ref().ok_or(SessionError::SessionClosed)
    }

    pub fn device_mut(&mut self) -> Result<&mut T::Handle> {
        self.handle.as_mut().ok_or(SessionError::SessionClosed)
    }

    pub fn identity(&self) -> Result<DeviceIdentity> {
        Ok(self.device()?.identity()?)
    }

    pub fn set_friendly_name(&mut self, name: &str) -> Result<()> {
        Ok(self.device_mut()?.set_friendly_name(name)?)
    }

    pub fn sync_partner(&self) -> Result<Option<String>> {
        Ok(self.device()?.sync_partner()?)
    }

    pub fn set_sync_partner(&mut self, partner: &str) -> Result<()> {
        Ok(self.device_mut()?.set_sync_partner(partner)?)
    }

    pub fn battery_level(&self) -> Result<BatteryLevel> {
        Ok(self.device()?.battery_level()?)
    }

    pub fn supported_filetypes(&self) -> Result<Vec<Filetype>> {
        Ok(self.device()?.supported_filetypes()?)
    }

    pub fn storage(&self, sort: StorageSort) -> Result<Vec<StorageInfo>> {
        Ok(self.device()?.storage(sort)?)
    }

    pub fn files(&self) -> Result<Vec<FileInfo>> {
        Ok(self.device()?.files()?)
    }

    pub fn file_info(&self, id: u32) -> Result<FileInfo> {
        Ok(self.device()?.file_info(id)?)
    }

    pub fn folders(&self) -> Result<Vec<FolderInfo>> {
        Ok(self.device()?.folders()?)
    }

    /// Download object `id` to `dest`, returning the number of bytes written
    pub fn get_file(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64> {
        Ok(self.device_mut()?.get_file(id, dest, progress)?)
    }

    /// Upload `src`, returning the id the device assigned
    pub fn send_file(
        &mut self,
        src: &Path,
        file: &NewFile,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u32> {
        Ok(self.device_mut()?.send_file(src, file, progress)?)
    }

    pub fn create_folder(&mut self, name: &str, parent_id: u32, storage_id: u32) -> Result<u32> {
        Ok(self.device_mut()?.create_folder(name, parent_id, storage_id)?)
    }

    pub fn delete_object(&mut self, id: u32) -> Result<()> {
        Ok(self.device_mut()?.delete_object(id)?)
    }

    pub fn reset(&mut self) -> Result<()> {
        Ok(self.device_mut()?.reset()?)
    }

    pub fn tracks(&self) -> Result<Vec<TrackInfo>> {
        Ok(self.device()?.tracks()?)
    }

    pub fn track(&self, id: u32) -> Result<TrackInfo> {
        Ok(self.device()?.track(id)?)
    }

    pub fn track_exists(&self, id: u32) -> Result<bool> {
        Ok(self.device()?.track_exists(id)?)
    }

    pub fn get_track(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64> {
        Ok(self.device_mut()?.get_track(id, dest, progress)?)
    }

    pub fn send_track(
        &mut self,
        src: &Path,
        track: &TrackInfo,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u32> {
        Ok(self.device_mut()?.send_track(src, track, progress)?)
    }

    pub fn update_track(&mut self, track: &TrackInfo) -> Result<()> {
        Ok(self.device_mut()?.update_track(track)?)
    }

    pub fn albums(&self) -> Result<Vec<AlbumInfo>> {
        Ok(self.device()?.albums()?)
    }

    pub fn album(&self, id: u32) -> Result<AlbumInfo> {
        Ok(self.device()?.album(id)?)
    }

    pub fn create_album(&mut self, album: &AlbumInfo) -> Result<u32> {
        Ok(self.device_mut()?.create_album(album)?)
    }

    pub fn update_album(&mut self, album: &AlbumInfo) -> Result<()> {
        Ok(self.device_mut()?.update_album(album)?)
    }

    pub fn playlists(&self) -> Result<Vec<PlaylistInfo>> {
        Ok(self.device()?.playlists()?)
    }

    pub fn playlist(&self, id: u32) -> Result<PlaylistInfo> {
        Ok(self.device()?.playlist(id)?)
    }

    pub fn create_playlist(&mut self, playlist: &PlaylistInfo) -> Result<u32> {
        Ok(self.device_mut()?.create_playlist(playlist)?)
    }

    pub fn update_playlist(&mut self, playlist: &PlaylistInfo) -> Result<()> {
        Ok(self.device_mut()?.update_playlist(playlist)?)
    }

    pub fn secure_time(&self) -> Result<String> {
        Ok(self.device()?.secure_time()?)
    }

    pub fn certificate(&self) -> Result<String> {
        Ok(self.device()?.certificate()?)
    }

    /// The device's error stack, left in place
    pub fn errors(&self) -> Result<Vec<String>> {
        Ok(self.device()?.errors()?)
    }

    pub fn clear_errors(&mut self) -> Result<()> {
        Ok(self.device_mut()?.clear_errors()?)
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::traits::Progress;
    use crate::testdb::{CallEvent, MockDeviceSpec, MockTransport};

    fn open_first(transport: &Arc<MockTransport>) -> DeviceSession<MockTransport> {
        let raw = transport.list_devices().unwrap().remove(0);
        DeviceSession::open(Arc::clone(transport), raw, 0).unwrap()
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )]));
        let journal = transport.journal();

        let mut session = open_first(&transport);
        assert!(!session.is_closed());

        session.close();
        session.close();
        session.close();
        drop(session);

        assert_eq!(journal.close_calls(), 1);
    }

    #[test]
    fn test_operations_after_close_fail_without_transport_calls() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )]));
        let journal = transport.journal();

        let mut session = open_first(&transport);
        session.close();
        let ops_before = journal.op_calls();

        assert!(matches!(session.identity(), Err(SessionError::SessionClosed)));
        assert!(matches!(session.battery_level(), Err(SessionError::SessionClosed)));
        assert!(matches!(session.files(), Err(SessionError::SessionClosed)));
        assert!(matches!(
            session.storage(StorageSort::NotSorted),
            Err(SessionError::SessionClosed)
        ));
        assert!(matches!(
            session.set_friendly_name("renamed"),
            Err(SessionError::SessionClosed)
        ));
        assert!(matches!(session.delete_object(1), Err(SessionError::SessionClosed)));
        assert!(matches!(session.device(), Err(SessionError::SessionClosed)));

        let mut progress = |_: u64, _: u64| Progress::Continue;
        assert!(matches!(
            session.get_file(1, Path::new("/nonexistent"), &mut progress),
            Err(SessionError::SessionClosed)
        ));

        assert_eq!(journal.op_calls(), ops_before);
    }

    #[test]
    fn test_media_and_drm_operations_after_close() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())
        .with_album("Debut", &["intro.mp3"])
        .with_playlist("Morning", &["intro.mp3"])
        .with_secure_clock()]));
        let journal = transport.journal();

        let mut session = open_first(&transport);
        session.close();
        let ops_before = journal.op_calls();

        let closed = |r: Result<()>| matches!(r, Err(SessionError::SessionClosed));
        let mut progress = |_: u64, _: u64| Progress::Continue;

        assert!(closed(session.tracks().map(drop)));
        assert!(closed(session.track(1).map(drop)));
        assert!(closed(session.track_exists(1).map(drop)));
        assert!(closed(
            session
                .get_track(1, Path::new("/nonexistent"), &mut progress)
                .map(drop)
        ));
        assert!(closed(
            session
                .send_track(Path::new("/nonexistent"), &TrackInfo::default(), &mut progress)
                .map(drop)
        ));
        assert!(closed(session.update_track(&TrackInfo::default())));
        assert!(closed(session.albums().map(drop)));
        assert!(closed(session.album(1).map(drop)));
        assert!(closed(session.create_album(&AlbumInfo::new("x")).map(drop)));
        assert!(closed(session.update_album(&AlbumInfo::new("x"))));
        assert!(closed(session.playlists().map(drop)));
        assert!(closed(session.playlist(1).map(drop)));
        assert!(closed(session.create_playlist(&PlaylistInfo::new("x")).map(drop)));
        assert!(closed(session.update_playlist(&PlaylistInfo::new("x"))));
        assert!(closed(session.secure_time().map(drop)));
        assert!(closed(session.certificate().map(drop)));
        assert!(closed(session.errors().map(drop)));
        assert!(closed(session.clear_errors()));
        assert!(closed(session.reset()));

        assert_eq!(journal.op_calls(), ops_before);
    }

    #[test]
    fn test_drop_releases_open_session() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "SanDisk", "Sansa",
        )]));
        let journal = transport.journal();

        {
            let _session = open_first(&transport);
            assert_eq!(journal.close_calls(), 0);
        }

        assert_eq!(journal.close_calls(), 1);
        assert_eq!(journal.events().last(), Some(&CallEvent::Close(0)));
    }

    #[test]
    fn test_open_failure_propagates_transport_error() {
        let transport = Arc::new(MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").busy("busy"),
        ]));
        let journal = transport.journal();

        let raw = transport.list_devices().unwrap().remove(0);
        let result = DeviceSession::open(Arc::clone(&transport), raw, 0);

        match result {
            Err(TransportError::Busy(msg)) => assert_eq!(msg, "busy"),
            other => panic!("expected busy error, got {:?}", other),
        }
        assert_eq!(journal.close_calls(), 0);
    }

    #[test]
    fn test_close_failure_is_swallowed() {
        let transport = Arc::new(MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").failing_close(),
        ]));
        let journal = transport.journal();

        let mut session = open_first(&transport);
        session.close();

        assert!(session.is_closed());
        assert_eq!(journal.close_calls(), 1);
    }

    #[test]
    fn test_operations_delegate_to_handle() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_file("song.mp3", b"ID3 audio".to_vec())]));

        let mut session = open_first(&transport);
        assert_eq!(session.index(), 0);
        assert!(session.label().contains("Creative ZEN"));

        let identity = session.identity().unwrap();
        assert_eq!(identity.model.as_deref(), Some("ZEN"));

        session.set_friendly_name("Gym player").unwrap();
        assert_eq!(
            session.identity().unwrap().friendly_name.as_deref(),
            Some("Gym player")
        );

        let files = session.files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filetype, Filetype::Mp3);

        session.delete_object(files[0].id).unwrap();
        assert!(session.files().unwrap().is_empty());
    }

    #[test]
    fn test_reset_delegates_to_handle() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_error("stale transaction")]));
        let journal = transport.journal();

        let mut session = open_first(&transport);
        assert_eq!(session.errors().unwrap(), vec!["stale transaction".to_string()]);

        session.reset().unwrap();

        assert!(journal.events().contains(&CallEvent::Op(0, "reset")));
        assert_eq!(transport.reset_count(0), 1);
        assert!(session.errors().unwrap().is_empty());
    }

    #[test]
    fn test_media_operations_delegate_to_handle() {
        let transport = Arc::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_track("intro.mp3", "Intro", "Band", b"ID3 intro".to_vec())
        .with_track("theme.mp3", "Theme", "Band", b"ID3 theme".to_vec())
        .with_secure_clock()]));

        let mut session = open_first(&transport);
        let tracks = session.tracks().unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(session.track_exists(tracks[0].id).unwrap());

        let mut renamed = session.track(tracks[0].id).unwrap();
        renamed.title = Some("Overture".to_string());
        session.update_track(&renamed).unwrap();
        assert_eq!(
            session.track(tracks[0].id).unwrap().title.as_deref(),
            Some("Overture")
        );

        let mut album = AlbumInfo::new("Debut");
        album.tracks = vec![tracks[0].id];
        let album_id = session.create_album(&album).unwrap();
        let mut album = session.album(album_id).unwrap();
        album.tracks.push(tracks[1].id);
        session.update_album(&album).unwrap();
        assert_eq!(session.albums().unwrap()[0].tracks.len(), 2);

        let mut playlist = PlaylistInfo::new("Morning");
        playlist.tracks = vec![tracks[1].id];
        let playlist_id = session.create_playlist(&playlist).unwrap();
        assert_eq!(session.playlist(playlist_id).unwrap().name, "Morning");
        assert_eq!(session.playlists().unwrap().len(), 1);

        assert!(session.secure_time().unwrap().contains("<SecureTime"));
        assert!(session.certificate().unwrap().contains("<Certificate"));
    }
}
