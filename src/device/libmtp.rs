//! Native transport over the system libmtp
//!
//! `LibmtpTransport` implements [`Transport`] on top of bindings that
//! `build.rs` generates from the installed `libmtp.h`, so struct layouts always
//! match the library being linked.
//!
//! Built only with the `libmtp` feature.

use crate::core::error::{TransportError, TransportResult};
use crate::device::filetype::Filetype;
use crate::device::traits::{
    AlbumInfo, BatteryLevel, DeviceEntry, DeviceIdentity, DeviceOps, FileInfo, FolderInfo,
    NewFile, PlaylistInfo, Progress, ProgressFn, RawDevice, RawDeviceInfo, StorageInfo,
    StorageSort, TrackInfo, Transport,
};
use chrono::{DateTime, Utc};
use libc::{c_char, c_int, c_void};
use log::{debug, warn};
use std::ffi::{CStr, CString};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Once;

#[allow(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    dead_code,
    clippy::all
)]
mod ffi {
    include!(concat!(env!("OUT_DIR"), "/libmtp_bindings.rs"));
}

// Progress callback return values
const PROGRESS_CONTINUE: c_int = 0;
const PROGRESS_CANCEL: c_int = 1;

/// `LIBMTP_Get_File_To_File` and `LIBMTP_Get_Track_To_File`
type DownloadFn = unsafe extern "C" fn(
    *mut ffi::LIBMTP_mtpdevice_t,
    u32,
    *const c_char,
    ffi::LIBMTP_progressfunc_t,
    *const c_void,
) -> c_int;

// ============================================================================
// Helpers
// ============================================================================

static INIT: Once = Once::new();

fn init_library() {
    INIT.call_once(|| {
        debug!("Initialising libmtp");
        // SAFETY: LIBMTP_Init has no preconditions and runs exactly once.
        unsafe { ffi::LIBMTP_Init() };
    });
}

/// Copy a C string the library keeps ownership of
fn borrowed_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null pointers from libmtp are NUL-terminated strings.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Take ownership of a malloc'd C string returned by libmtp
fn owned_string(ptr: *mut c_char) -> Option<String> {
    let value = borrowed_string(ptr);
    if !ptr.is_null() {
        // SAFETY: libmtp allocated this string with malloc and handed it over.
        unsafe { libc::free(ptr.cast()) };
    }
    value
}

fn c_string(value: &str) -> TransportResult<CString> {
    CString::new(value).map_err(|_| TransportError::Other(format!("embedded NUL in {:?}", value)))
}

fn c_path(path: &Path) -> TransportResult<CString> {
    let value = path
        .to_str()
        .ok_or_else(|| TransportError::Other(format!("non UTF-8 path: {}", path.display())))?;
    c_string(value)
}

/// A malloc'd copy of `value`, for struct fields libmtp frees itself
fn dup(value: &str) -> TransportResult<*mut c_char> {
    let value = c_string(value)?;
    // SAFETY: `value` is NUL-terminated; strdup copies it.
    let copy = unsafe { libc::strdup(value.as_ptr()) };
    if copy.is_null() {
        return Err(allocation_error());
    }
    Ok(copy)
}

fn dup_opt(value: Option<&str>) -> TransportResult<*mut c_char> {
    value.map_or(Ok(ptr::null_mut()), dup)
}

/// A malloc'd copy of `ids`, for structs whose destroy function frees the list
fn malloc_ids(ids: &[u32]) -> TransportResult<*mut u32> {
    if ids.is_empty() {
        return Ok(ptr::null_mut());
    }
    // SAFETY: plain allocation, checked for NULL below.
    let array = unsafe { libc::malloc(std::mem::size_of_val(ids)) }.cast::<u32>();
    if array.is_null() {
        return Err(allocation_error());
    }
    // SAFETY: `array` has room for `ids.len()` entries and cannot overlap `ids`.
    unsafe { ptr::copy_nonoverlapping(ids.as_ptr(), array, ids.len()) };
    Ok(array)
}

fn ids_from_raw(ptr: *const u32, len: u32) -> Vec<u32> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    // SAFETY: libmtp keeps `len` entries behind `ptr` for the lifetime of the struct.
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }.to_vec()
}

fn allocation_error() -> TransportError {
    error_from_code(ffi::LIBMTP_ERROR_MEMORY_ALLOCATION, "allocating metadata")
}

fn error_from_code(code: ffi::LIBMTP_error_number_t, context: &str) -> TransportError {
    match code {
        ffi::LIBMTP_ERROR_PTP_LAYER => {
            TransportError::Protocol(format!("{}: PTP layer error", context))
        }
        ffi::LIBMTP_ERROR_USB_LAYER => {
            TransportError::Unavailable(format!("{}: USB layer error", context))
        }
        ffi::LIBMTP_ERROR_MEMORY_ALLOCATION => {
            TransportError::Other(format!("{}: memory allocation failed", context))
        }
        ffi::LIBMTP_ERROR_STORAGE_FULL => {
            TransportError::Protocol(format!("{}: storage full", context))
        }
        ffi::LIBMTP_ERROR_CONNECTING => {
            TransportError::Unavailable(format!("{}: error connecting to device", context))
        }
        ffi::LIBMTP_ERROR_CANCELLED => TransportError::Cancelled,
        _ => TransportError::Other(format!("{}: libmtp error {}", context, code)),
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

/// A libmtp metadata struct we own; its destroy function runs on drop
///
/// Destroy functions free one node plus the strings and arrays it points to,
/// never the `next` node.
struct Owned<T> {
    ptr: NonNull<T>,
    destroy: unsafe extern "C" fn(*mut T),
}

impl<T> Owned<T> {
    /// # Safety
    ///
    /// `ptr` must be NULL or a struct allocated by libmtp that nothing else
    /// frees, and `destroy` its matching `LIBMTP_destroy_*` function.
    unsafe fn new(ptr: *mut T, destroy: unsafe extern "C" fn(*mut T)) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, destroy })
    }

    fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the pointer is valid until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the pointer is valid until drop and only reachable through `self`.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: `new`'s contract pairs the pointer with its destroy function.
        unsafe { (self.destroy)(self.ptr.as_ptr()) };
    }
}

/// State shared with the C progress trampoline
struct ProgressContext<'a, 'b> {
    callback: &'a mut ProgressFn<'b>,
    cancelled: bool,
}

/// # Safety
///
/// `data` must be NULL or point to the live `ProgressContext` set up by
/// `with_progress`.
unsafe extern "C" fn progress_trampoline(sent: u64, total: u64, data: *const c_void) -> c_int {
    if data.is_null() {
        return PROGRESS_CONTINUE;
    }
    // SAFETY: per the function contract `data` is the `ProgressContext` of the
    // transfer in progress, and nothing else touches it during the callback.
    let ctx = unsafe { &mut *(data as *mut ProgressContext<'_, '_>) };

    // A panic must not unwind into C
    let answer = panic::catch_unwind(AssertUnwindSafe(|| (ctx.callback)(sent, total)));
    match answer {
        Ok(Progress::Continue) => PROGRESS_CONTINUE,
        Ok(Progress::Cancel) | Err(_) => {
            ctx.cancelled = true;
            PROGRESS_CANCEL
        }
    }
}

/// Run a libmtp transfer with `progress` wired to its callback
fn with_progress<F>(progress: &mut ProgressFn<'_>, call: F) -> (c_int, bool)
where
    F: FnOnce(ffi::LIBMTP_progressfunc_t, *const c_void) -> c_int,
{
    let mut ctx = ProgressContext {
        callback: progress,
        cancelled: false,
    };
    let data = &mut ctx as *mut ProgressContext<'_, '_> as *const c_void;
    let ret = call(Some(progress_trampoline), data);
    (ret, ctx.cancelled)
}

// ============================================================================
// Conversions
// ============================================================================

fn entry_from_raw(entry: &ffi::LIBMTP_device_entry_t) -> DeviceEntry {
    DeviceEntry {
        vendor: borrowed_string(entry.vendor),
        vendor_id: entry.vendor_id,
        product: borrowed_string(entry.product),
        product_id: entry.product_id,
        device_flags: entry.device_flags,
    }
}

fn file_from_raw(file: &ffi::LIBMTP_file_t) -> FileInfo {
    FileInfo {
        id: file.item_id,
        parent_id: file.parent_id,
        storage_id: file.storage_id,
        name: borrowed_string(file.filename).unwrap_or_default(),
        size: file.filesize,
        modified: timestamp(file.modificationdate as i64),
        filetype: Filetype::from_code(file.filetype as u32),
    }
}

fn track_from_raw(track: &ffi::LIBMTP_track_t) -> TrackInfo {
    TrackInfo {
        id: track.item_id,
        parent_id: track.parent_id,
        storage_id: track.storage_id,
        title: borrowed_string(track.title),
        artist: borrowed_string(track.artist),
        composer: borrowed_string(track.composer),
        genre: borrowed_string(track.genre),
        album: borrowed_string(track.album),
        date: borrowed_string(track.date),
        filename: borrowed_string(track.filename).unwrap_or_default(),
        track_number: track.tracknumber,
        duration: track.duration,
        sample_rate: track.samplerate,
        channels: track.nochannels,
        wave_codec: track.wavecodec,
        bitrate: track.bitrate,
        bitrate_type: track.bitratetype,
        rating: track.rating,
        use_count: track.usecount,
        size: track.filesize,
        modified: timestamp(track.modificationdate as i64),
        filetype: Filetype::from_code(track.filetype as u32),
    }
}

fn album_from_raw(album: &ffi::LIBMTP_album_t) -> AlbumInfo {
    AlbumInfo {
        id: album.album_id,
        parent_id: album.parent_id,
        storage_id: album.storage_id,
        name: borrowed_string(album.name).unwrap_or_default(),
        artist: borrowed_string(album.artist),
        composer: borrowed_string(album.composer),
        genre: borrowed_string(album.genre),
        tracks: ids_from_raw(album.tracks, album.no_tracks),
    }
}

fn playlist_from_raw(playlist: &ffi::LIBMTP_playlist_t) -> PlaylistInfo {
    PlaylistInfo {
        id: playlist.playlist_id,
        parent_id: playlist.parent_id,
        storage_id: playlist.storage_id,
        name: borrowed_string(playlist.name).unwrap_or_default(),
        tracks: ids_from_raw(playlist.tracks, playlist.no_tracks),
    }
}

fn new_track(track: &TrackInfo) -> TransportResult<Owned<ffi::LIBMTP_track_t>> {
    // SAFETY: LIBMTP_new_track_t returns a zeroed, malloc'd track_t or NULL.
    let mut meta = unsafe { Owned::new(ffi::LIBMTP_new_track_t(), ffi::LIBMTP_destroy_track_t) }
        .ok_or_else(allocation_error)?;

    meta.item_id = track.id;
    meta.parent_id = track.parent_id;
    meta.storage_id = track.storage_id;
    meta.title = dup_opt(track.title.as_deref())?;
    meta.artist = dup_opt(track.artist.as_deref())?;
    meta.composer = dup_opt(track.composer.as_deref())?;
    meta.genre = dup_opt(track.genre.as_deref())?;
    meta.album = dup_opt(track.album.as_deref())?;
    meta.date = dup_opt(track.date.as_deref())?;
    meta.filename = dup(&track.filename)?;
    meta.tracknumber = track.track_number;
    meta.duration = track.duration;
    meta.samplerate = track.sample_rate;
    meta.nochannels = track.channels;
    meta.wavecodec = track.wave_codec;
    meta.bitrate = track.bitrate;
    meta.bitratetype = track.bitrate_type;
    meta.rating = track.rating;
    meta.usecount = track.use_count;
    meta.filesize = track.size;
    meta.modificationdate = track.modified.map_or(0, |t| t.timestamp()) as _;
    meta.filetype = track.filetype.code() as ffi::LIBMTP_filetype_t;
    Ok(meta)
}

fn new_album(album: &AlbumInfo) -> TransportResult<Owned<ffi::LIBMTP_album_t>> {
    // SAFETY: LIBMTP_new_album_t returns a zeroed, malloc'd album_t or NULL.
    let mut meta = unsafe { Owned::new(ffi::LIBMTP_new_album_t(), ffi::LIBMTP_destroy_album_t) }
        .ok_or_else(allocation_error)?;

    meta.album_id = album.id;
    meta.parent_id = album.parent_id;
    meta.storage_id = album.storage_id;
    meta.name = dup(&album.name)?;
    meta.artist = dup_opt(album.artist.as_deref())?;
    meta.composer = dup_opt(album.composer.as_deref())?;
    meta.genre = dup_opt(album.genre.as_deref())?;
    meta.tracks = malloc_ids(&album.tracks)?;
    meta.no_tracks = album.tracks.len() as u32;
    Ok(meta)
}

fn new_playlist(playlist: &PlaylistInfo) -> TransportResult<Owned<ffi::LIBMTP_playlist_t>> {
    // SAFETY: LIBMTP_new_playlist_t returns a zeroed, malloc'd playlist_t or NULL.
    let mut meta =
        unsafe { Owned::new(ffi::LIBMTP_new_playlist_t(), ffi::LIBMTP_destroy_playlist_t) }
            .ok_or_else(allocation_error)?;

    meta.playlist_id = playlist.id;
    meta.parent_id = playlist.parent_id;
    meta.storage_id = playlist.storage_id;
    meta.name = dup(&playlist.name)?;
    meta.tracks = malloc_ids(&playlist.tracks)?;
    meta.no_tracks = playlist.tracks.len() as u32;
    Ok(meta)
}

fn flatten_folders(node: *const ffi::LIBMTP_folder_t, out: &mut Vec<FolderInfo>) {
    let mut current = node;
    while !current.is_null() {
        // SAFETY: folder trees from libmtp are NULL-terminated at every level
        // and stay alive until the caller destroys the root.
        let folder = unsafe { &*current };
        out.push(FolderInfo {
            id: folder.folder_id,
            parent_id: folder.parent_id,
            storage_id: folder.storage_id,
            name: borrowed_string(folder.name).unwrap_or_default(),
        });
        flatten_folders(folder.child, out);
        current = folder.sibling;
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A device found by `LIBMTP_Detect_Raw_Devices`
pub struct LibmtpRawDevice {
    raw: ffi::LIBMTP_raw_device_t,
    info: RawDeviceInfo,
}

// SAFETY: the only pointers inside are vendor/product names from libmtp's
// static device table, which are never written to.
unsafe impl Send for LibmtpRawDevice {}

impl RawDevice for LibmtpRawDevice {
    fn info(&self) -> RawDeviceInfo {
        self.info.clone()
    }
}

/// An opened libmtp device
pub struct LibmtpDevice {
    ptr: NonNull<ffi::LIBMTP_mtpdevice_t>,
}

// SAFETY: a libmtp device may be used from any thread as long as calls are
// not concurrent; `DeviceOps` takes `&mut self` or is serialised by the
// session owner.
unsafe impl Send for LibmtpDevice {}

impl LibmtpDevice {
    fn raw(&self) -> *mut ffi::LIBMTP_mtpdevice_t {
        self.ptr.as_ptr()
    }

    /// Messages on the device error stack, oldest first, left in place
    fn error_messages(&self) -> Vec<String> {
        // SAFETY: the device pointer is valid while the handle is alive.
        let mut node = unsafe { ffi::LIBMTP_Get_Errorstack(self.raw()) };
        let mut messages = Vec::new();
        while !node.is_null() {
            // SAFETY: nodes form a NULL-terminated list owned by the device
            // and only changed by calls made through this handle.
            let error = unsafe { &*node };
            if let Some(text) = borrowed_string(error.error_text) {
                messages.push(text);
            }
            node = error.next;
        }
        messages
    }

    /// Drain the device error stack into one message
    fn take_errors(&self) -> Option<String> {
        let messages = self.error_messages();
        // SAFETY: valid device; nothing borrowed from the stack is still alive.
        unsafe { ffi::LIBMTP_Clear_Errorstack(self.raw()) };

        if messages.is_empty() {
            None
        } else {
            Some(messages.join("; "))
        }
    }

    fn failure(&self, context: &str) -> TransportError {
        match self.take_errors() {
            Some(detail) => TransportError::Protocol(format!("{}: {}", context, detail)),
            None => TransportError::Protocol(context.to_string()),
        }
    }

    fn check(&self, ret: c_int, context: &str) -> TransportResult<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(self.failure(context))
        }
    }

    /// A NULL listing means empty unless the error stack says otherwise
    fn empty_or_error(&self, context: &str) -> TransportResult<()> {
        match self.take_errors() {
            Some(detail) => Err(TransportError::Protocol(format!("{}: {}", context, detail))),
            None => Ok(()),
        }
    }

    fn string_property(
        &self,
        getter: unsafe extern "C" fn(*mut ffi::LIBMTP_mtpdevice_t) -> *mut c_char,
    ) -> Option<String> {
        // SAFETY: valid device; property getters return a malloc'd string or NULL.
        owned_string(unsafe { getter(self.raw()) })
    }

    /// A DRM property returned through a `char **` out-parameter
    fn drm_property(
        &self,
        getter: unsafe extern "C" fn(*mut ffi::LIBMTP_mtpdevice_t, *mut *mut c_char) -> c_int,
        context: &str,
    ) -> TransportResult<String> {
        let mut xml: *mut c_char = ptr::null_mut();
        // SAFETY: valid device; the out-pointer references a live local that
        // libmtp leaves NULL or sets to a malloc'd string.
        let ret = unsafe { getter(self.raw(), &mut xml) };
        let value = owned_string(xml);
        self.check(ret, context)?;
        value.ok_or_else(|| TransportError::Protocol(format!("{}: device returned nothing", context)))
    }

    /// Copy object `id` to `dest` with `fetch`; a cancelled copy leaves no file behind
    fn download(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
        fetch: DownloadFn,
    ) -> TransportResult<()> {
        let path = c_path(dest)?;
        let device = self.raw();

        let (ret, cancelled) = with_progress(progress, |callback, data| {
            // SAFETY: valid device; `path` and the callback context outlive the call.
            unsafe { fetch(device, id, path.as_ptr(), callback, data) }
        });

        if cancelled {
            let _ = self.take_errors();
            let _ = std::fs::remove_file(dest);
            return Err(TransportError::Cancelled);
        }
        self.check(ret, &format!("downloading object {}", id))
    }
}

impl DeviceOps for LibmtpDevice {
    fn identity(&self) -> TransportResult<DeviceIdentity> {
        Ok(DeviceIdentity {
            manufacturer: self.string_property(ffi::LIBMTP_Get_Manufacturername),
            model: self.string_property(ffi::LIBMTP_Get_Modelname),
            serial_number: self.string_property(ffi::LIBMTP_Get_Serialnumber),
            version: self.string_property(ffi::LIBMTP_Get_Deviceversion),
            friendly_name: self.string_property(ffi::LIBMTP_Get_Friendlyname),
        })
    }

    fn set_friendly_name(&mut self, name: &str) -> TransportResult<()> {
        let name = c_string(name)?;
        // SAFETY: valid device and NUL-terminated name, copied by libmtp.
        let ret = unsafe { ffi::LIBMTP_Set_Friendlyname(self.raw(), name.as_ptr()) };
        self.check(ret, "setting friendly name")
    }

    fn sync_partner(&self) -> TransportResult<Option<String>> {
        Ok(self.string_property(ffi::LIBMTP_Get_Syncpartner))
    }

    fn set_sync_partner(&mut self, partner: &str) -> TransportResult<()> {
        let partner = c_string(partner)?;
        // SAFETY: valid device and NUL-terminated partner name, copied by libmtp.
        let ret = unsafe { ffi::LIBMTP_Set_Syncpartner(self.raw(), partner.as_ptr()) };
        self.check(ret, "setting sync partner")
    }

    fn battery_level(&self) -> TransportResult<BatteryLevel> {
        let mut level = BatteryLevel::default();
        // SAFETY: valid device; out-pointers reference live locals.
        let ret = unsafe {
            ffi::LIBMTP_Get_Batterylevel(self.raw(), &mut level.max, &mut level.current)
        };
        self.check(ret, "reading battery level")?;
        Ok(level)
    }

    fn supported_filetypes(&self) -> TransportResult<Vec<Filetype>> {
        let mut types: *mut u16 = ptr::null_mut();
        let mut length: u16 = 0;
        // SAFETY: valid device; out-pointers reference live locals.
        let ret =
            unsafe { ffi::LIBMTP_Get_Supported_Filetypes(self.raw(), &mut types, &mut length) };
        self.check(ret, "reading supported filetypes")?;

        if types.is_null() {
            return Ok(Vec::new());
        }
        // SAFETY: libmtp returned a malloc'd array of `length` entries.
        let codes = unsafe { std::slice::from_raw_parts(types, length as usize) };
        let filetypes = codes.iter().map(|&c| Filetype::from_code(c as u32)).collect();
        // SAFETY: the array is ours and `codes` is not used past this point.
        unsafe { libc::free(types.cast()) };
        Ok(filetypes)
    }

    fn storage(&self, sort: StorageSort) -> TransportResult<Vec<StorageInfo>> {
        // SAFETY: valid device.
        let ret = unsafe { ffi::LIBMTP_Get_Storage(self.raw(), sort.code()) };
        if ret != 0 {
            return Err(self.failure("reading storage"));
        }

        let mut storages = Vec::new();
        // SAFETY: valid device; the call above refreshed its storage list.
        let mut node = unsafe { (*self.raw()).storage };
        while !node.is_null() {
            // SAFETY: `storage` is a NULL-terminated list owned by the device.
            let storage = unsafe { &*node };
            storages.push(StorageInfo {
                id: storage.id,
                storage_type: storage.StorageType,
                filesystem_type: storage.FilesystemType,
                access_capability: storage.AccessCapability,
                max_capacity: storage.MaxCapacity,
                free_space_bytes: storage.FreeSpaceInBytes,
                free_space_objects: storage.FreeSpaceInObjects,
                description: borrowed_string(storage.StorageDescription),
                volume_id: borrowed_string(storage.VolumeIdentifier),
            });
            node = storage.next;
        }
        Ok(storages)
    }

    fn files(&self) -> TransportResult<Vec<FileInfo>> {
        // SAFETY: valid device; no progress callback.
        let mut node =
            unsafe { ffi::LIBMTP_Get_Filelisting_With_Callback(self.raw(), None, ptr::null()) };
        if node.is_null() {
            self.empty_or_error("listing files")?;
        }

        let mut files = Vec::new();
        // SAFETY: every node of the listing is a malloc'd file_t handed to us.
        while let Some(file) = unsafe { Owned::new(node, ffi::LIBMTP_destroy_file_t) } {
            node = file.next;
            files.push(file_from_raw(&file));
        }
        Ok(files)
    }

    fn file_info(&self, id: u32) -> TransportResult<FileInfo> {
        // SAFETY: valid device; a non-NULL result is a malloc'd file_t handed to us.
        let file = unsafe {
            Owned::new(ffi::LIBMTP_Get_Filemetadata(self.raw(), id), ffi::LIBMTP_destroy_file_t)
        };
        match file {
            Some(file) => Ok(file_from_raw(&file)),
            None => {
                let _ = self.take_errors();
                Err(TransportError::NotFound(id))
            }
        }
    }

    fn folders(&self) -> TransportResult<Vec<FolderInfo>> {
        // SAFETY: valid device.
        let root = unsafe { ffi::LIBMTP_Get_Folder_List(self.raw()) };
        let mut folders = Vec::new();
        if root.is_null() {
            self.empty_or_error("listing folders")?;
            return Ok(folders);
        }

        flatten_folders(root, &mut folders);
        // SAFETY: destroys the whole tree returned above; nothing borrows it any more.
        unsafe { ffi::LIBMTP_destroy_folder_t(root) };
        Ok(folders)
    }

    fn get_file(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u64> {
        let size = self.file_info(id)?.size;
        self.download(id, dest, progress, ffi::LIBMTP_Get_File_To_File)?;
        Ok(size)
    }

    fn send_file(
        &mut self,
        src: &Path,
        file: &NewFile,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32> {
        let size = std::fs::metadata(src)?.len();
        let path = c_path(src)?;
        let device = self.raw();

        // SAFETY: LIBMTP_new_file_t returns a zeroed, malloc'd file_t or NULL.
        let mut meta = unsafe { Owned::new(ffi::LIBMTP_new_file_t(), ffi::LIBMTP_destroy_file_t) }
            .ok_or_else(allocation_error)?;
        meta.filename = dup(&file.name)?;
        meta.filesize = size;
        meta.filetype = file.filetype.code() as ffi::LIBMTP_filetype_t;
        meta.parent_id = file.parent_id;
        meta.storage_id = file.storage_id;

        let meta_ptr = meta.as_ptr();
        let (ret, cancelled) = with_progress(progress, |callback, data| {
            // SAFETY: valid device; `path`, `meta` and the callback context
            // outlive the call.
            unsafe {
                ffi::LIBMTP_Send_File_From_File(device, path.as_ptr(), meta_ptr, callback, data)
            }
        });

        if cancelled {
            let _ = self.take_errors();
            return Err(TransportError::Cancelled);
        }
        self.check(ret, &format!("sending {}", src.display()))?;
        // libmtp writes the new object id back into the metadata
        Ok(meta.item_id)
    }

    fn create_folder(
        &mut self,
        name: &str,
        parent_id: u32,
        storage_id: u32,
    ) -> TransportResult<u32> {
        let name = c_string(name)?;
        // SAFETY: valid device; libmtp copies the name and neither keeps nor frees it.
        let id = unsafe {
            ffi::LIBMTP_Create_Folder(
                self.raw(),
                name.as_ptr() as *mut c_char,
                parent_id,
                storage_id,
            )
        };
        if id == 0 {
            return Err(self.failure("creating folder"));
        }
        Ok(id)
    }

    fn delete_object(&mut self, id: u32) -> TransportResult<()> {
        // SAFETY: valid device.
        let ret = unsafe { ffi::LIBMTP_Delete_Object(self.raw(), id) };
        self.check(ret, &format!("deleting object {}", id))
    }

    fn reset(&mut self) -> TransportResult<()> {
        // SAFETY: valid device.
        let ret = unsafe { ffi::LIBMTP_Reset_Device(self.raw()) };
        self.check(ret, "resetting device")
    }

    fn tracks(&self) -> TransportResult<Vec<TrackInfo>> {
        // SAFETY: valid device; no progress callback.
        let mut node =
            unsafe { ffi::LIBMTP_Get_Tracklisting_With_Callback(self.raw(), None, ptr::null()) };
        if node.is_null() {
            self.empty_or_error("listing tracks")?;
        }

        let mut tracks = Vec::new();
        // SAFETY: every node of the listing is a malloc'd track_t handed to us.
        while let Some(track) = unsafe { Owned::new(node, ffi::LIBMTP_destroy_track_t) } {
            node = track.next;
            tracks.push(track_from_raw(&track));
        }
        Ok(tracks)
    }

    fn track(&self, id: u32) -> TransportResult<TrackInfo> {
        // SAFETY: valid device; a non-NULL result is a malloc'd track_t handed to us.
        let track = unsafe {
            Owned::new(ffi::LIBMTP_Get_Trackmetadata(self.raw(), id), ffi::LIBMTP_destroy_track_t)
        };
        match track {
            Some(track) => Ok(track_from_raw(&track)),
            None => {
                let _ = self.take_errors();
                Err(TransportError::NotFound(id))
            }
        }
    }

    fn track_exists(&self, id: u32) -> TransportResult<bool> {
        // SAFETY: valid device.
        Ok(unsafe { ffi::LIBMTP_Track_Exists(self.raw(), id) } != 0)
    }

    fn get_track(
        &mut self,
        id: u32,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u64> {
        let size = self.track(id)?.size;
        self.download(id, dest, progress, ffi::LIBMTP_Get_Track_To_File)?;
        Ok(size)
    }

    fn send_track(
        &mut self,
        src: &Path,
        track: &TrackInfo,
        progress: &mut ProgressFn<'_>,
    ) -> TransportResult<u32> {
        let size = std::fs::metadata(src)?.len();
        let path = c_path(src)?;
        let device = self.raw();

        let meta = new_track(&TrackInfo {
            id: 0,
            size,
            modified: None,
            ..track.clone()
        })?;

        let meta_ptr = meta.as_ptr();
        let (ret, cancelled) = with_progress(progress, |callback, data| {
            // SAFETY: valid device; `path`, `meta` and the callback context
            // outlive the call.
            unsafe {
                ffi::LIBMTP_Send_Track_From_File(device, path.as_ptr(), meta_ptr, callback, data)
            }
        });

        if cancelled {
            let _ = self.take_errors();
            return Err(TransportError::Cancelled);
        }
        self.check(ret, &format!("sending track {}", src.display()))?;
        Ok(meta.item_id)
    }

    fn update_track(&mut self, track: &TrackInfo) -> TransportResult<()> {
        let meta = new_track(track)?;
        // SAFETY: valid device; `meta` is a complete track_t that libmtp only reads.
        let ret = unsafe { ffi::LIBMTP_Update_Track_Metadata(self.raw(), meta.as_ptr()) };
        self.check(ret, &format!("updating track {}", track.id))
    }

    fn albums(&self) -> TransportResult<Vec<AlbumInfo>> {
        // SAFETY: valid device.
        let mut node = unsafe { ffi::LIBMTP_Get_Album_List(self.raw()) };
        if node.is_null() {
            self.empty_or_error("listing albums")?;
        }

        let mut albums = Vec::new();
        // SAFETY: every node of the list is a malloc'd album_t handed to us.
        while let Some(album) = unsafe { Owned::new(node, ffi::LIBMTP_destroy_album_t) } {
            node = album.next;
            albums.push(album_from_raw(&album));
        }
        Ok(albums)
    }

    fn album(&self, id: u32) -> TransportResult<AlbumInfo> {
        // SAFETY: valid device; a non-NULL result is a malloc'd album_t handed to us.
        let album = unsafe {
            Owned::new(ffi::LIBMTP_Get_Album(self.raw(), id), ffi::LIBMTP_destroy_album_t)
        };
        match album {
            Some(album) => Ok(album_from_raw(&album)),
            None => {
                let _ = self.take_errors();
                Err(TransportError::NotFound(id))
            }
        }
    }

    fn create_album(&mut self, album: &AlbumInfo) -> TransportResult<u32> {
        let meta = new_album(&AlbumInfo {
            id: 0,
            ..album.clone()
        })?;
        // SAFETY: valid device; `meta` is a complete album_t that libmtp
        // fills with the new id.
        let ret = unsafe { ffi::LIBMTP_Create_New_Album(self.raw(), meta.as_ptr()) };
        self.check(ret, &format!("creating album {}", album.name))?;
        Ok(meta.album_id)
    }

    fn update_album(&mut self, album: &AlbumInfo) -> TransportResult<()> {
        let meta = new_album(album)?;
        // SAFETY: valid device; `meta` is a complete album_t that libmtp only reads.
        let ret = unsafe { ffi::LIBMTP_Update_Album(self.raw(), meta.as_ptr()) };
        self.check(ret, &format!("updating album {}", album.id))
    }

    fn playlists(&self) -> TransportResult<Vec<PlaylistInfo>> {
        // SAFETY: valid device.
        let mut node = unsafe { ffi::LIBMTP_Get_Playlist_List(self.raw()) };
        if node.is_null() {
            self.empty_or_error("listing playlists")?;
        }

        let mut playlists = Vec::new();
        // SAFETY: every node of the list is a malloc'd playlist_t handed to us.
        while let Some(playlist) = unsafe { Owned::new(node, ffi::LIBMTP_destroy_playlist_t) } {
            node = playlist.next;
            playlists.push(playlist_from_raw(&playlist));
        }
        Ok(playlists)
    }

    fn playlist(&self, id: u32) -> TransportResult<PlaylistInfo> {
        // SAFETY: valid device; a non-NULL result is a malloc'd playlist_t handed to us.
        let playlist = unsafe {
            Owned::new(ffi::LIBMTP_Get_Playlist(self.raw(), id), ffi::LIBMTP_destroy_playlist_t)
        };
        match playlist {
            Some(playlist) => Ok(playlist_from_raw(&playlist)),
            None => {
                let _ = self.take_errors();
                Err(TransportError::NotFound(id))
            }
        }
    }

    fn create_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<u32> {
        let meta = new_playlist(&PlaylistInfo {
            id: 0,
            ..playlist.clone()
        })?;
        // SAFETY: valid device; `meta` is a complete playlist_t that libmtp
        // fills with the new id.
        let ret = unsafe { ffi::LIBMTP_Create_New_Playlist(self.raw(), meta.as_ptr()) };
        self.check(ret, &format!("creating playlist {}", playlist.name))?;
        Ok(meta.playlist_id)
    }

    fn update_playlist(&mut self, playlist: &PlaylistInfo) -> TransportResult<()> {
        let meta = new_playlist(playlist)?;
        // SAFETY: valid device; `meta` is a complete playlist_t that libmtp only reads.
        let ret = unsafe { ffi::LIBMTP_Update_Playlist(self.raw(), meta.as_ptr()) };
        self.check(ret, &format!("updating playlist {}", playlist.id))
    }

    fn secure_time(&self) -> TransportResult<String> {
        self.drm_property(ffi::LIBMTP_Get_Secure_Time, "reading secure time")
    }

    fn certificate(&self) -> TransportResult<String> {
        self.drm_property(ffi::LIBMTP_Get_Device_Certificate, "reading device certificate")
    }

    fn errors(&self) -> TransportResult<Vec<String>> {
        Ok(self.error_messages())
    }

    fn clear_errors(&mut self) -> TransportResult<()> {
        // SAFETY: valid device.
        unsafe { ffi::LIBMTP_Clear_Errorstack(self.raw()) };
        Ok(())
    }
}

/// Transport backed by the system libmtp
#[derive(Debug, Default)]
pub struct LibmtpTransport;

impl LibmtpTransport {
    pub fn new() -> Self {
        init_library();
        Self
    }
}

impl Transport for LibmtpTransport {
    type Raw = LibmtpRawDevice;
    type Handle = LibmtpDevice;

    fn name(&self) -> &'static str {
        "libmtp"
    }

    fn list_devices(&self) -> TransportResult<Vec<LibmtpRawDevice>> {
        init_library();

        let mut raw: *mut ffi::LIBMTP_raw_device_t = ptr::null_mut();
        let mut count: c_int = 0;
        // SAFETY: out-pointers reference live locals.
        let ret = unsafe { ffi::LIBMTP_Detect_Raw_Devices(&mut raw, &mut count) };

        match ret {
            ffi::LIBMTP_ERROR_NONE => {}
            ffi::LIBMTP_ERROR_NO_DEVICE_ATTACHED => return Ok(Vec::new()),
            code => return Err(error_from_code(code, "detecting devices")),
        }
        if raw.is_null() || count <= 0 {
            return Ok(Vec::new());
        }

        // SAFETY: libmtp returned a malloc'd array of `count` raw devices.
        let found = unsafe { std::slice::from_raw_parts(raw, count as usize) };
        let devices = found
            .iter()
            .map(|device| LibmtpRawDevice {
                raw: *device,
                info: RawDeviceInfo {
                    entry: entry_from_raw(&device.device_entry),
                    bus_location: device.bus_location,
                    devnum: device.devnum,
                },
            })
            .collect();
        // SAFETY: entries were copied out and `found` is not used past this point.
        unsafe { libc::free(raw.cast()) };

        Ok(devices)
    }

    fn open_session(&self, mut raw: LibmtpRawDevice) -> TransportResult<LibmtpDevice> {
        // SAFETY: `raw.raw` is a copy of an entry from LIBMTP_Detect_Raw_Devices.
        let device = unsafe { ffi::LIBMTP_Open_Raw_Device_Uncached(&mut raw.raw) };

        match NonNull::new(device) {
            Some(ptr) => Ok(LibmtpDevice { ptr }),
            None => Err(TransportError::Busy(format!(
                "unable to open {} (claimed by another process?)",
                raw.info.label()
            ))),
        }
    }

    fn close_session(&self, handle: LibmtpDevice) -> TransportResult<()> {
        if let Some(detail) = handle.take_errors() {
            warn!("Pending libmtp errors at close: {}", detail);
        }
        // SAFETY: each handle is released exactly once; `handle` is consumed.
        unsafe { ffi::LIBMTP_Release_Device(handle.raw()) };
        Ok(())
    }

    fn supported_devices(&self) -> TransportResult<Vec<DeviceEntry>> {
        init_library();

        let mut entries: *mut ffi::LIBMTP_device_entry_t = ptr::null_mut();
        let mut count: c_int = 0;
        // SAFETY: out-pointers reference live locals.
        let ret = unsafe { ffi::LIBMTP_Get_Supported_Devices_List(&mut entries, &mut count) };
        if ret != 0 {
            return Err(error_from_code(ffi::LIBMTP_ERROR_GENERAL, "reading device table"));
        }
        if entries.is_null() || count <= 0 {
            return Ok(Vec::new());
        }

        // SAFETY: static table owned by libmtp; not freed.
        let table = unsafe { std::slice::from_raw_parts(entries, count as usize) };
        Ok(table.iter().map(entry_from_raw).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert!(matches!(
            error_from_code(ffi::LIBMTP_ERROR_USB_LAYER, "detecting devices"),
            TransportError::Unavailable(_)
        ));
        assert!(matches!(
            error_from_code(ffi::LIBMTP_ERROR_CANCELLED, "x"),
            TransportError::Cancelled
        ));
        let other = error_from_code(42, "detecting devices");
        assert_eq!(other.to_string(), "detecting devices: libmtp error 42");
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(timestamp(0), None);
        assert_eq!(timestamp(86_400).map(|t| t.timestamp()), Some(86_400));
    }

    #[test]
    fn test_trampoline_reports_cancel() {
        let mut seen = Vec::new();
        let mut callback = |sent: u64, total: u64| {
            seen.push((sent, total));
            if sent >= 10 {
                Progress::Cancel
            } else {
                Progress::Continue
            }
        };

        let (ret, cancelled) = with_progress(&mut callback, |cb, data| {
            let cb = cb.unwrap();
            // SAFETY: `data` is the context `with_progress` just built.
            unsafe {
                assert_eq!(cb(5, 20, data), PROGRESS_CONTINUE);
                cb(10, 20, data)
            }
        });

        assert_eq!(ret, PROGRESS_CANCEL);
        assert!(cancelled);
        assert_eq!(seen, vec![(5, 20), (10, 20)]);
    }

    #[test]
    fn test_c_string_rejects_nul() {
        assert!(c_string("ok").is_ok());
        assert!(c_string("bad\0name").is_err());
    }

    #[test]
    fn test_id_list_copies() {
        let ids = [3u32, 5, 8];
        let raw = malloc_ids(&ids).unwrap();
        assert_eq!(ids_from_raw(raw, 3), ids.to_vec());
        // SAFETY: allocated by malloc_ids above and not used again.
        unsafe { libc::free(raw.cast()) };

        assert!(malloc_ids(&[]).unwrap().is_null());
        assert!(ids_from_raw(ptr::null(), 4).is_empty());
    }
}
