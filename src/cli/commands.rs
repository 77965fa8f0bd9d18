//! Command handler implementations
//!
//! Device commands are written once against `SessionManager<T>` and run with
//! whichever transport was selected: a `--simulate` scenario or, when built
//! with the `libmtp` feature, the native library.

use crate::cli::args::{
    AlbumCommands, Args, Commands, ConfigCommands, PlaylistCommands, TrackCommands, TrackTags,
};
use crate::cli::progress::{
    format_bytes, print_error, print_header, print_info, print_success, print_warning,
    TransferProgress,
};
use crate::core::config::{get_config_path, init_config, write_default_config, Config};
use crate::core::error::{ConnectEachError, SessionError, TransportError};
use crate::device::traits::{
    AlbumInfo, FolderInfo, NewFile, PlaylistInfo, StorageSort, TrackInfo, Transport,
};
use crate::session::{DeviceSession, SessionManager, SessionOptions};
use crate::testdb::{list_scenario_names, list_tags, ScenarioLibrary, TestScenario};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Run the appropriate command based on CLI arguments
pub fn run_command(args: &Args, config: &Config, shutdown_flag: Arc<AtomicBool>) -> Result<()> {
    match &args.command {
        Commands::Scenarios { tag } => {
            list_scenarios(tag.as_deref());
            Ok(())
        }
        Commands::Config { action } => handle_config_command(action, config),
        _ => {
            let options = session_options(args, config);
            debug!("Session options: {:?}", options);

            match &args.simulate {
                Some(name) => {
                    let scenario = ScenarioLibrary::get(name).ok_or_else(|| {
                        anyhow!(
                            "Unknown scenario '{}'. Available: {}",
                            name,
                            list_scenario_names().join(", ")
                        )
                    })?;
                    info!("Simulating scenario '{}': {}", scenario.name, scenario.description);

                    let manager = SessionManager::with_options(scenario.transport(), options);
                    run_device_command(&manager, args, config, shutdown_flag)
                }
                None => run_native(args, config, options, shutdown_flag),
            }
        }
    }
}

#[cfg(feature = "libmtp")]
fn run_native(
    args: &Args,
    config: &Config,
    options: SessionOptions,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    let manager = SessionManager::with_options(crate::device::LibmtpTransport::new(), options);
    run_device_command(&manager, args, config, shutdown_flag)
}

#[cfg(not(feature = "libmtp"))]
fn run_native(
    _args: &Args,
    _config: &Config,
    _options: SessionOptions,
    _shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    bail!(
        "This build has no native MTP support. Rebuild with '--features libmtp', \
         or try a simulated device with '--simulate single_player'."
    )
}

/// Session options from the config file with command-line overrides applied
fn session_options(args: &Args, config: &Config) -> SessionOptions {
    let mut options = config.session.options();
    if args.fail_fast {
        options.open_policy = crate::session::OpenPolicy::FailFast;
    }
    if let Some(secs) = args.timeout {
        options.discovery_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    options
}

fn run_device_command<T: Transport>(
    manager: &SessionManager<T>,
    args: &Args,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    match &args.command {
        Commands::List { json } => list_devices(manager, *json),
        Commands::Info => for_each_device(manager, args.all, show_info),
        Commands::Storage { sort } => {
            let sort = StorageSort::from(*sort);
            for_each_device(manager, args.all, |session| show_storage(session, sort))
        }
        Commands::Files { json } => {
            for_each_device(manager, args.all, |session| show_files(session, *json))
        }
        Commands::Folders => for_each_device(manager, args.all, show_folders),
        Commands::Filetypes => for_each_device(manager, args.all, show_filetypes),
        Commands::Get { id, dest, force } => manager.connect_one_with(|session| {
            let overwrite = *force || config.transfer.overwrite_existing;
            get_file(session, *id, dest, overwrite, config, shutdown_flag)
        }),
        Commands::Send {
            src,
            parent,
            storage,
        } => manager.connect_one_with(|session| {
            let file = NewFile::from_path(src)
                .with_parent(*parent)
                .with_storage(*storage);
            send_file(session, src, &file, config, shutdown_flag)
        }),
        Commands::Mkdir {
            name,
            parent,
            storage,
        } => manager.connect_one_with(|session| {
            let id = session.create_folder(name, *parent, *storage)?;
            print_success(&format!("Created folder '{}' (id {})", name, id));
            Ok(())
        }),
        Commands::Delete { id } => manager.connect_one_with(|session| {
            session.delete_object(*id)?;
            print_success(&format!("Deleted object {}", id));
            Ok(())
        }),
        Commands::Rename { name } => manager.connect_one_with(|session| {
            session.set_friendly_name(name)?;
            print_success(&format!("Device renamed to '{}'", name));
            Ok(())
        }),
        Commands::SyncPartner { name } => manager.connect_one_with(|session| {
            session.set_sync_partner(name)?;
            print_success(&format!("Sync partner set to '{}'", name));
            Ok(())
        }),
        Commands::Reset => manager.connect_one_with(|session| {
            session.reset()?;
            print_success("Device reset");
            Ok(())
        }),
        Commands::Track { action } => run_track_command(manager, action, args, config, shutdown_flag),
        Commands::Album { action } => run_album_command(manager, action, args.all),
        Commands::Playlist { action } => run_playlist_command(manager, action, args.all),
        Commands::SecureTime => for_each_device(manager, args.all, |session| {
            println!("{}", session.secure_time()?);
            Ok(())
        }),
        Commands::Certificate => for_each_device(manager, args.all, |session| {
            println!("{}", session.certificate()?);
            Ok(())
        }),
        Commands::Errors { clear } => {
            for_each_device(manager, args.all, |session| show_errors(session, *clear))
        }
        Commands::Supported => list_supported(manager.transport()),
        // Handled before a transport is chosen
        Commands::Scenarios { .. } | Commands::Config { .. } => Ok(()),
    }
}

/// Run `f` on the first device, or on every device with `--all`
///
/// With `--all`, every device is visited (or stopped early under fail-fast)
/// and failures are listed once all sessions are closed.
fn for_each_device<T, F>(manager: &SessionManager<T>, all: bool, mut f: F) -> Result<()>
where
    T: Transport,
    F: FnMut(&mut DeviceSession<T>) -> Result<()>,
{
    if !all {
        return manager.connect_one_with(|session| f(session));
    }

    let result = manager.connect_all_with(|session| {
        print_header(&format!("Device #{}: {}", session.index() + 1, session.label()));
        f(session)
    });

    match result {
        Ok(0) => Err(SessionError::NoDevice.into()),
        Ok(visited) => {
            info!("Done with {} device(s)", visited);
            Ok(())
        }
        Err(ConnectEachError::Discovery(e)) => Err(e.into()),
        Err(ConnectEachError::Devices(failures)) => {
            println!();
            for failure in &failures {
                print_error(&failure.to_string());
            }
            bail!("{} device(s) failed", failures.len())
        }
    }
}

/// Discover devices without opening them
pub fn list_devices<T: Transport>(manager: &SessionManager<T>, json: bool) -> Result<()> {
    info!("Scanning for MTP devices via {}...", manager.transport().name());
    let devices = manager.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        info!("No MTP devices found.");
        info!("");
        info!("Make sure the device is:");
        info!("  1. Connected via USB cable");
        info!("  2. Unlocked, and set to MTP / file transfer mode");
        info!("  3. Not claimed by another program (file manager, media player)");
        return Ok(());
    }

    info!("Found {} device(s):", devices.len());
    info!("");
    for (i, device) in devices.iter().enumerate() {
        info!("[{}] {}", i + 1, device.entry);
        info!("    Bus {}, device {}", device.bus_location, device.devnum);
        if device.entry.device_flags != 0 {
            info!("    Quirk flags: 0x{:08x}", device.entry.device_flags);
        }
        info!("");
    }

    Ok(())
}

fn show_info<T: Transport>(session: &mut DeviceSession<T>) -> Result<()> {
    let identity = session.identity()?;

    println!("Name:          {}", identity.display_name());
    println!(
        "Manufacturer:  {}",
        identity.manufacturer.as_deref().unwrap_or("-")
    );
    println!("Model:         {}", identity.model.as_deref().unwrap_or("-"));
    println!(
        "Serial number: {}",
        identity.serial_number.as_deref().unwrap_or("-")
    );
    println!("Version:       {}", identity.version.as_deref().unwrap_or("-"));

    match session.battery_level() {
        Ok(level) => match level.percent() {
            Some(pct) => println!("Battery:       {}%", pct),
            None => println!("Battery:       {}/{}", level.current, level.max),
        },
        // Devices on mains power commonly refuse the battery query
        Err(e) => debug!("Battery level unavailable: {}", e),
    }

    let partner = session.sync_partner()?;
    println!("Sync partner:  {}", partner.as_deref().unwrap_or("-"));
    Ok(())
}

fn show_storage<T: Transport>(session: &mut DeviceSession<T>, sort: StorageSort) -> Result<()> {
    let storages = session.storage(sort)?;
    if storages.is_empty() {
        print_warning("Device reports no storage");
        return Ok(());
    }

    for storage in &storages {
        println!(
            "{:#010x}  {}",
            storage.id,
            storage.description.as_deref().unwrap_or("(unnamed storage)")
        );
        println!(
            "            {} free of {} ({} used){}",
            format_bytes(storage.free_space_bytes),
            format_bytes(storage.max_capacity),
            format_bytes(storage.used_bytes()),
            if storage.is_writable() { "" } else { ", read-only" }
        );
    }
    Ok(())
}

fn show_files<T: Transport>(session: &mut DeviceSession<T>, json: bool) -> Result<()> {
    let files = session.files()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    if files.is_empty() {
        print_info("No files on device");
        return Ok(());
    }

    println!("{:>8}  {:>10}  {:<20}  NAME", "ID", "SIZE", "MODIFIED");
    for file in &files {
        let modified = file
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>8}  {:>10}  {:<20}  {}",
            file.id,
            format_bytes(file.size),
            modified,
            file.name
        );
    }
    println!();
    print_info(&format!(
        "{} file(s), {}",
        files.len(),
        format_bytes(files.iter().map(|f| f.size).sum())
    ));
    Ok(())
}

fn show_folders<T: Transport>(session: &mut DeviceSession<T>) -> Result<()> {
    let folders = session.folders()?;
    if folders.is_empty() {
        print_info("No folders on device");
        return Ok(());
    }

    for line in folder_tree_lines(&folders) {
        println!("{}", line);
    }
    Ok(())
}

/// Render a flat folder list as an indented tree, one line per folder
///
/// Folders whose parent chain never reaches the root (a missing parent, or a
/// parent loop) are listed under an "(orphaned)" group.
fn folder_tree_lines(folders: &[FolderInfo]) -> Vec<String> {
    let mut children: BTreeMap<u32, Vec<&FolderInfo>> = BTreeMap::new();
    for folder in folders {
        children.entry(folder.parent_id).or_default().push(folder);
    }

    fn walk(
        parent: u32,
        depth: usize,
        children: &BTreeMap<u32, Vec<&FolderInfo>>,
        seen: &mut BTreeSet<u32>,
        lines: &mut Vec<String>,
    ) {
        let Some(entries) = children.get(&parent) else {
            return;
        };
        for folder in entries {
            if !seen.insert(folder.id) {
                continue;
            }
            lines.push(format!("{}{} ({})", "  ".repeat(depth), folder.name, folder.id));
            walk(folder.id, depth + 1, children, seen, lines);
        }
    }

    let mut lines = Vec::with_capacity(folders.len() + 1);
    let mut seen = BTreeSet::new();
    walk(0, 0, &children, &mut seen, &mut lines);

    if folders.iter().all(|f| seen.contains(&f.id)) {
        return lines;
    }

    lines.push("(orphaned)".to_string());
    let known: BTreeSet<u32> = folders.iter().map(|f| f.id).collect();
    // Folders with a missing parent head their own subtree; loops are broken wherever they are met
    let detached = folders
        .iter()
        .filter(|f| !known.contains(&f.parent_id))
        .chain(folders.iter());
    for folder in detached {
        if seen.insert(folder.id) {
            lines.push(format!("  {} ({})", folder.name, folder.id));
            walk(folder.id, 2, &children, &mut seen, &mut lines);
        }
    }
    lines
}

fn show_filetypes<T: Transport>(session: &mut DeviceSession<T>) -> Result<()> {
    let filetypes = session.supported_filetypes()?;
    for filetype in &filetypes {
        println!("{:>3}  {}", filetype.code(), filetype.description());
    }
    print_info(&format!("{} supported file type(s)", filetypes.len()));
    Ok(())
}

/// Download object `id`; a directory destination keeps the device file name
fn get_file<T: Transport>(
    session: &mut DeviceSession<T>,
    id: u32,
    dest: &Path,
    overwrite: bool,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    let info = session.file_info(id)?;
    let dest = download_target(dest, &info.name, overwrite)?;

    let progress = TransferProgress::new(&info.name, config.transfer.show_progress, shutdown_flag);
    match session.get_file(id, &dest, &mut |sent, total| progress.update(sent, total)) {
        Ok(bytes) => {
            progress.finish(bytes);
            print_success(&format!("Saved {} to {}", info.name, dest.display()));
            Ok(())
        }
        Err(e) => {
            progress.finish_with_error(&e.to_string());
            Err(transfer_error(e))
        }
    }
}

/// Where a download of `name` lands; a directory destination keeps the device name
fn download_target(dest: &Path, name: &str, overwrite: bool) -> Result<PathBuf> {
    let dest = if dest.is_dir() {
        dest.join(name)
    } else {
        dest.to_path_buf()
    };

    if dest.exists() && !overwrite {
        bail!(
            "{} already exists (use --force to overwrite)",
            dest.display()
        );
    }
    Ok(dest)
}

fn send_file<T: Transport>(
    session: &mut DeviceSession<T>,
    src: &Path,
    file: &NewFile,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    if !src.is_file() {
        bail!("{} is not a file", src.display());
    }

    let progress = TransferProgress::new(&file.name, config.transfer.show_progress, shutdown_flag);
    match session.send_file(src, file, &mut |sent, total| progress.update(sent, total)) {
        Ok(id) => {
            let size = std::fs::metadata(src)
                .with_context(|| format!("reading {}", src.display()))?
                .len();
            progress.finish(size);
            print_success(&format!("Sent {} as object {} ({})", file.name, id, file.filetype));
            Ok(())
        }
        Err(e) => {
            progress.finish_with_error(&e.to_string());
            Err(transfer_error(e))
        }
    }
}

fn run_track_command<T: Transport>(
    manager: &SessionManager<T>,
    action: &TrackCommands,
    args: &Args,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    match action {
        TrackCommands::List { json } => {
            for_each_device(manager, args.all, |session| show_tracks(session, *json))
        }
        TrackCommands::Show { id } => manager.connect_one_with(|session| {
            if !session.track_exists(*id)? {
                bail!("Object {} is not a track", id);
            }
            print_track(&session.track(*id)?);
            Ok(())
        }),
        TrackCommands::Get { id, dest, force } => manager.connect_one_with(|session| {
            let overwrite = *force || config.transfer.overwrite_existing;
            get_track(session, *id, dest, overwrite, config, shutdown_flag)
        }),
        TrackCommands::Send {
            src,
            tags,
            parent,
            storage,
        } => manager.connect_one_with(|session| {
            let mut track = TrackInfo::from_path(src)
                .with_parent(*parent)
                .with_storage(*storage);
            apply_tags(&mut track, tags);
            send_track(session, src, &track, config, shutdown_flag)
        }),
        TrackCommands::Tag { id, tags } => manager.connect_one_with(|session| {
            let mut track = session.track(*id)?;
            apply_tags(&mut track, tags);
            session.update_track(&track)?;
            print_success(&format!("Updated track {}: {}", id, track.display_name()));
            Ok(())
        }),
    }
}

/// Overwrite the fields given on the command line, leave the rest
fn apply_tags(track: &mut TrackInfo, tags: &TrackTags) {
    let TrackTags {
        title,
        artist,
        album,
        genre,
        number,
        rating,
    } = tags.clone();

    if title.is_some() {
        track.title = title;
    }
    if artist.is_some() {
        track.artist = artist;
    }
    if album.is_some() {
        track.album = album;
    }
    if genre.is_some() {
        track.genre = genre;
    }
    if let Some(number) = number {
        track.track_number = number;
    }
    if let Some(rating) = rating {
        track.rating = rating;
    }
}

fn show_tracks<T: Transport>(session: &mut DeviceSession<T>, json: bool) -> Result<()> {
    let tracks = session.tracks()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
        return Ok(());
    }

    if tracks.is_empty() {
        print_info("No tracks on device");
        return Ok(());
    }

    println!("{:>8}  {:>6}  {:<40}  ALBUM", "ID", "LENGTH", "TRACK");
    for track in &tracks {
        println!(
            "{:>8}  {:>6}  {:<40}  {}",
            track.id,
            format_duration(track.duration),
            track.display_name(),
            track.album.as_deref().unwrap_or("-")
        );
    }
    println!();
    print_info(&format!("{} track(s)", tracks.len()));
    Ok(())
}

fn print_track(track: &TrackInfo) {
    let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

    println!("Id:          {}", track.id);
    println!("File:        {} ({})", track.filename, track.filetype);
    println!("Title:       {}", text(&track.title));
    println!("Artist:      {}", text(&track.artist));
    println!("Composer:    {}", text(&track.composer));
    println!("Album:       {}", text(&track.album));
    println!("Genre:       {}", text(&track.genre));
    println!("Date:        {}", text(&track.date));
    println!("Track no.:   {}", track.track_number);
    println!("Length:      {}", format_duration(track.duration));
    println!("Size:        {}", format_bytes(track.size));
    if track.bitrate > 0 {
        println!("Bitrate:     {} bit/s", track.bitrate);
    }
    if track.sample_rate > 0 {
        println!("Sample rate: {} Hz, {} channel(s)", track.sample_rate, track.channels);
    }
    println!("Rating:      {}", track.rating);
    println!("Play count:  {}", track.use_count);
}

/// Milliseconds as m:ss
fn format_duration(ms: u32) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn get_track<T: Transport>(
    session: &mut DeviceSession<T>,
    id: u32,
    dest: &Path,
    overwrite: bool,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    let track = session.track(id)?;
    let dest = download_target(dest, &track.filename, overwrite)?;

    let progress =
        TransferProgress::new(&track.filename, config.transfer.show_progress, shutdown_flag);
    match session.get_track(id, &dest, &mut |sent, total| progress.update(sent, total)) {
        Ok(bytes) => {
            progress.finish(bytes);
            print_success(&format!("Saved {} to {}", track.display_name(), dest.display()));
            Ok(())
        }
        Err(e) => {
            progress.finish_with_error(&e.to_string());
            Err(transfer_error(e))
        }
    }
}

fn send_track<T: Transport>(
    session: &mut DeviceSession<T>,
    src: &Path,
    track: &TrackInfo,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    if !src.is_file() {
        bail!("{} is not a file", src.display());
    }

    let progress =
        TransferProgress::new(&track.filename, config.transfer.show_progress, shutdown_flag);
    match session.send_track(src, track, &mut |sent, total| progress.update(sent, total)) {
        Ok(id) => {
            let size = std::fs::metadata(src)
                .with_context(|| format!("reading {}", src.display()))?
                .len();
            progress.finish(size);
            print_success(&format!("Sent {} as track {}", track.display_name(), id));
            Ok(())
        }
        Err(e) => {
            progress.finish_with_error(&e.to_string());
            Err(transfer_error(e))
        }
    }
}

/// Append `extra` to `tracks`, skipping ids already present; returns how many were added
fn append_tracks(tracks: &mut Vec<u32>, extra: &[u32]) -> usize {
    let before = tracks.len();
    for id in extra {
        if !tracks.contains(id) {
            tracks.push(*id);
        }
    }
    tracks.len() - before
}

fn print_track_ids(tracks: &[u32]) {
    if tracks.is_empty() {
        println!("  (no tracks)");
        return;
    }
    for (i, id) in tracks.iter().enumerate() {
        println!("  {:>3}. track {}", i + 1, id);
    }
}

fn run_album_command<T: Transport>(
    manager: &SessionManager<T>,
    action: &AlbumCommands,
    all: bool,
) -> Result<()> {
    match action {
        AlbumCommands::List { json } => for_each_device(manager, all, |session| {
            let albums = session.albums()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&albums)?);
                return Ok(());
            }
            for album in &albums {
                println!(
                    "{:>8}  {} - {} ({} track(s))",
                    album.id,
                    album.artist.as_deref().unwrap_or("Unknown artist"),
                    album.name,
                    album.tracks.len()
                );
            }
            print_info(&format!("{} album(s)", albums.len()));
            Ok(())
        }),
        AlbumCommands::Show { id } => manager.connect_one_with(|session| {
            let album = session.album(*id)?;
            println!("{} ({})", album.name, album.id);
            if let Some(artist) = &album.artist {
                println!("Artist: {}", artist);
            }
            if let Some(genre) = &album.genre {
                println!("Genre:  {}", genre);
            }
            print_track_ids(&album.tracks);
            Ok(())
        }),
        AlbumCommands::Create {
            name,
            artist,
            genre,
            tracks,
            parent,
            storage,
        } => manager.connect_one_with(|session| {
            let album = AlbumInfo {
                parent_id: *parent,
                storage_id: *storage,
                artist: artist.clone(),
                genre: genre.clone(),
                tracks: tracks.clone(),
                ..AlbumInfo::new(name)
            };
            let id = session.create_album(&album)?;
            print_success(&format!("Created album '{}' (id {})", name, id));
            Ok(())
        }),
        AlbumCommands::Add { id, tracks } => manager.connect_one_with(|session| {
            let mut album = session.album(*id)?;
            let added = append_tracks(&mut album.tracks, tracks);
            session.update_album(&album)?;
            print_success(&format!("Added {} track(s) to album '{}'", added, album.name));
            Ok(())
        }),
    }
}

fn run_playlist_command<T: Transport>(
    manager: &SessionManager<T>,
    action: &PlaylistCommands,
    all: bool,
) -> Result<()> {
    match action {
        PlaylistCommands::List { json } => for_each_device(manager, all, |session| {
            let playlists = session.playlists()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&playlists)?);
                return Ok(());
            }
            for playlist in &playlists {
                println!(
                    "{:>8}  {} ({} track(s))",
                    playlist.id,
                    playlist.name,
                    playlist.tracks.len()
                );
            }
            print_info(&format!("{} playlist(s)", playlists.len()));
            Ok(())
        }),
        PlaylistCommands::Show { id } => manager.connect_one_with(|session| {
            let playlist = session.playlist(*id)?;
            println!("{} ({})", playlist.name, playlist.id);
            print_track_ids(&playlist.tracks);
            Ok(())
        }),
        PlaylistCommands::Create {
            name,
            tracks,
            parent,
            storage,
        } => manager.connect_one_with(|session| {
            let playlist = PlaylistInfo {
                parent_id: *parent,
                storage_id: *storage,
                tracks: tracks.clone(),
                ..PlaylistInfo::new(name)
            };
            let id = session.create_playlist(&playlist)?;
            print_success(&format!("Created playlist '{}' (id {})", name, id));
            Ok(())
        }),
        PlaylistCommands::Add { id, tracks } => manager.connect_one_with(|session| {
            let mut playlist = session.playlist(*id)?;
            let added = append_tracks(&mut playlist.tracks, tracks);
            session.update_playlist(&playlist)?;
            print_success(&format!(
                "Added {} track(s) to playlist '{}'",
                added, playlist.name
            ));
            Ok(())
        }),
    }
}

fn show_errors<T: Transport>(session: &mut DeviceSession<T>, clear: bool) -> Result<()> {
    let errors = session.errors()?;
    if errors.is_empty() {
        print_info("Error stack is empty");
    }
    for (i, message) in errors.iter().enumerate() {
        println!("{:>3}. {}", i + 1, message);
    }

    if clear && !errors.is_empty() {
        session.clear_errors()?;
        print_success(&format!("Cleared {} error(s)", errors.len()));
    }
    Ok(())
}

fn transfer_error(e: SessionError) -> anyhow::Error {
    match e.transport() {
        Some(TransportError::Cancelled) => anyhow!("Transfer cancelled"),
        _ => e.into(),
    }
}

fn list_supported<T: Transport>(transport: &T) -> Result<()> {
    let entries = transport.supported_devices()?;
    if entries.is_empty() {
        warn!("The {} transport has no device table", transport.name());
        return Ok(());
    }

    for entry in &entries {
        println!("{}", entry);
    }
    print_info(&format!("{} known device(s)", entries.len()));
    Ok(())
}

/// Print the scenarios available to `--simulate`, grouped by first tag
pub fn list_scenarios(tag: Option<&str>) {
    print_header("SIMULATED DEVICE SCENARIOS");

    let scenarios = match tag {
        Some(tag) => ScenarioLibrary::scenarios_by_tag(tag),
        None => ScenarioLibrary::all_scenarios(),
    };

    let mut by_category: BTreeMap<String, Vec<&TestScenario>> = BTreeMap::new();
    for scenario in &scenarios {
        let category = scenario
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| "other".to_string());
        by_category.entry(category).or_default().push(scenario);
    }

    for (category, scenarios) in &by_category {
        println!("{}", category.to_uppercase());
        for scenario in scenarios {
            println!("   • {} - {}", scenario.name, scenario.description);
        }
        println!();
    }

    println!("Total: {} scenario(s)", scenarios.len());
    println!("Tags: {}", list_tags().join(", "));
    println!("Use with: mtp-session --simulate <SCENARIO> <COMMAND>");
}

pub fn handle_config_command(action: &ConfigCommands, config: &Config) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let path = Config::get_active_config_path();
            info!("Configuration file: {}", path.display());
            if !path.exists() {
                info!("(Using default settings - no config file found)");
            }
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            let path = Config::get_active_config_path();
            println!("{}", path.display());
            if !path.exists() {
                info!("Config file would be created at: {}", path.display());
            }
        }
        ConfigCommands::Init { output } => {
            let path = match output {
                Some(path) => {
                    if !write_default_config(path)? {
                        print_warning(&format!("{} already exists, left unchanged", path.display()));
                    }
                    path.clone()
                }
                None => init_config()?,
            };
            print_success(&format!("Configuration file: {}", path.display()));
            if get_config_path().as_deref() != Some(path.as_path()) {
                info!("Pass it with --config, or copy it to the standard location.");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OpenPolicy;
    use crate::testdb::{MockDeviceSpec, MockTransport};
    use clap::Parser;
    use std::fs;
    use tempfile::tempdir;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.transfer.show_progress = false;
        config
    }

    fn no_shutdown() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_session_options_overrides() {
        let config = Config::default();

        let options = session_options(&parse(&["mtp-session", "info"]), &config);
        assert_eq!(options.open_policy, OpenPolicy::BestEffort);
        assert_eq!(options.discovery_timeout, Some(Duration::from_secs(10)));

        let options = session_options(
            &parse(&["mtp-session", "--fail-fast", "--timeout", "0", "info"]),
            &config,
        );
        assert_eq!(options.open_policy, OpenPolicy::FailFast);
        assert_eq!(options.discovery_timeout, None);
    }

    #[test]
    fn test_simulated_commands_run() {
        let config = quiet_config();
        for argv in [
            ["mtp-session", "--simulate", "single_player", "info"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "list"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "storage", "--sort", "max"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "files", "--json"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "folders"].as_slice(),
            ["mtp-session", "--simulate", "two_players", "--all", "filetypes"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "reset"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "track", "list"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "track", "show", "3"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "album", "list", "--json"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "playlist", "list"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "secure-time"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "certificate"].as_slice(),
            ["mtp-session", "--simulate", "single_player", "errors", "--clear"].as_slice(),
        ] {
            let args = parse(argv);
            assert!(run_command(&args, &config, no_shutdown()).is_ok(), "{:?}", argv);
        }
    }

    #[test]
    fn test_unknown_scenario() {
        let args = parse(&["mtp-session", "--simulate", "nope", "info"]);
        let err = run_command(&args, &quiet_config(), no_shutdown()).unwrap_err();
        assert!(err.to_string().contains("Unknown scenario 'nope'"));
    }

    #[test]
    fn test_no_devices_is_an_error_for_device_commands() {
        let args = parse(&["mtp-session", "--simulate", "no_devices", "info"]);
        let err = run_command(&args, &quiet_config(), no_shutdown()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NoDevice)
        ));

        // Listing nothing is not a failure
        let args = parse(&["mtp-session", "--simulate", "no_devices", "list"]);
        assert!(run_command(&args, &quiet_config(), no_shutdown()).is_ok());
    }

    #[test]
    fn test_all_reports_busy_device() {
        let args = parse(&["mtp-session", "--simulate", "three_devices_one_busy", "--all", "info"]);
        let err = run_command(&args, &quiet_config(), no_shutdown()).unwrap_err();
        assert_eq!(err.to_string(), "1 device(s) failed");
    }

    #[test]
    fn test_get_file_refuses_overwrite() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").with_file("song.mp3", b"ID3".to_vec()),
        ]));
        let dir = tempdir().unwrap();
        let existing = dir.path().join("song.mp3");
        fs::write(&existing, b"local").unwrap();

        let result: Result<()> = manager.connect_one_with(|session| {
            let id = session.files()?[0].id;
            get_file(session, id, &existing, false, &quiet_config(), no_shutdown())
        });
        assert!(result.unwrap_err().to_string().contains("already exists"));
        assert_eq!(fs::read(&existing).unwrap(), b"local");

        let result: Result<()> = manager.connect_one_with(|session| {
            let id = session.files()?[0].id;
            get_file(session, id, &existing, true, &quiet_config(), no_shutdown())
        });
        assert!(result.is_ok());
        assert_eq!(fs::read(&existing).unwrap(), b"ID3");
    }

    #[test]
    fn test_get_file_into_directory_uses_device_name() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").with_file("track.flac", vec![1, 2, 3]),
        ]));
        let dir = tempdir().unwrap();

        let result: Result<()> = manager.connect_one_with(|session| {
            let id = session.files()?[0].id;
            get_file(session, id, dir.path(), false, &quiet_config(), no_shutdown())
        });

        assert!(result.is_ok());
        assert_eq!(fs::read(dir.path().join("track.flac")).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancelled_transfer() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![
            MockDeviceSpec::player("Creative", "ZEN").with_file("song.mp3", vec![0u8; 10]),
        ]));
        let dir = tempdir().unwrap();
        let shutdown = Arc::new(AtomicBool::new(true));

        let result: Result<()> = manager.connect_one_with(|session| {
            let id = session.files()?[0].id;
            get_file(session, id, &dir.path().join("out.mp3"), false, &quiet_config(), shutdown)
        });

        assert_eq!(result.unwrap_err().to_string(), "Transfer cancelled");
        assert!(!dir.path().join("out.mp3").exists());
    }

    #[test]
    fn test_send_file() {
        let transport = MockTransport::with_devices(vec![MockDeviceSpec::player("Creative", "ZEN")]);
        let manager = SessionManager::new(transport);
        let dir = tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        fs::write(&src, b"hello device").unwrap();

        let sent: Result<()> = manager.connect_one_with(|session| {
            send_file(session, &src, &NewFile::from_path(&src), &quiet_config(), no_shutdown())
        });
        assert!(sent.is_ok());

        let files = manager
            .connect_one()
            .unwrap()
            .files()
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.txt");

        let missing = dir.path().join("missing.txt");
        let result: Result<()> = manager.connect_one_with(|session| {
            send_file(session, &missing, &NewFile::from_path(&missing), &quiet_config(), no_shutdown())
        });
        assert!(result.unwrap_err().to_string().contains("is not a file"));
    }

    #[test]
    fn test_folder_tree_lines() {
        let folder = |id, parent_id, name: &str| FolderInfo {
            id,
            parent_id,
            storage_id: 1,
            name: name.to_string(),
        };
        let folders = vec![
            folder(1, 0, "Music"),
            folder(2, 1, "Albums"),
            folder(3, 0, "Pictures"),
            folder(4, 2, "Live"),
        ];

        assert_eq!(
            folder_tree_lines(&folders),
            vec!["Music (1)", "  Albums (2)", "    Live (4)", "Pictures (3)"]
        );
    }

    #[test]
    fn test_folder_tree_lists_orphans() {
        let folder = |id, parent_id, name: &str| FolderInfo {
            id,
            parent_id,
            storage_id: 1,
            name: name.to_string(),
        };

        let looped = vec![folder(1, 0, "Music"), folder(2, 3, "Left"), folder(3, 2, "Right")];
        assert_eq!(
            folder_tree_lines(&looped),
            vec!["Music (1)", "(orphaned)", "  Left (2)", "    Right (3)"]
        );

        // The child comes first, but its missing-parent ancestor still heads the subtree
        let dangling = vec![folder(5, 4, "Child"), folder(4, 99, "Lost"), folder(6, 6, "Self")];
        assert_eq!(
            folder_tree_lines(&dangling),
            vec!["(orphaned)", "  Lost (4)", "    Child (5)", "  Self (6)"]
        );
    }

    #[test]
    fn test_reset_command_reaches_device() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )]));
        let args = parse(&["mtp-session", "reset"]);

        run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap();

        assert_eq!(manager.transport().reset_count(0), 1);
        assert_eq!(manager.transport().journal().close_calls(), 1);
    }

    #[test]
    fn test_track_tag_command() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())]));
        let args = parse(&["mtp-session", "track", "tag", "1", "--title", "Overture", "--rating", "60"]);

        run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap();

        let track = manager.connect_one().unwrap().track(1).unwrap();
        assert_eq!(track.title.as_deref(), Some("Overture"));
        assert_eq!(track.artist.as_deref(), Some("Band"));
        assert_eq!(track.rating, 60);
    }

    #[test]
    fn test_track_show_rejects_plain_file() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_file("cover.jpg", vec![0xFF, 0xD8])]));
        let args = parse(&["mtp-session", "track", "show", "1"]);

        let err = run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap_err();
        assert_eq!(err.to_string(), "Object 1 is not a track");
    }

    #[test]
    fn test_send_and_get_track_commands() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )]));
        let dir = tempdir().unwrap();
        let src = dir.path().join("song.mp3");
        fs::write(&src, b"ID3 song").unwrap();
        let src_arg = src.to_string_lossy().into_owned();

        let args = parse(&["mtp-session", "track", "send", &src_arg, "--artist", "Band"]);
        run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap();

        let tracks = manager.connect_one().unwrap().tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].display_name(), "Band - song");

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let id = tracks[0].id.to_string();
        let out_arg = out.to_string_lossy().into_owned();
        let args = parse(&["mtp-session", "track", "get", &id, &out_arg]);
        run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap();

        assert_eq!(fs::read(out.join("song.mp3")).unwrap(), b"ID3 song");
    }

    #[test]
    fn test_album_and_playlist_commands() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_track("intro.mp3", "Intro", "Band", b"ID3".to_vec())
        .with_track("theme.mp3", "Theme", "Band", b"ID3".to_vec())]));
        let run = |argv: &[&str]| run_device_command(&manager, &parse(argv), &quiet_config(), no_shutdown());

        run(&["mtp-session", "album", "create", "Debut", "--artist", "Band", "--tracks", "1"]).unwrap();
        run(&["mtp-session", "playlist", "create", "Morning"]).unwrap();

        let session = manager.connect_one().unwrap();
        let album_id = session.albums().unwrap()[0].id.to_string();
        let playlist_id = session.playlists().unwrap()[0].id.to_string();
        drop(session);

        run(&["mtp-session", "album", "add", &album_id, "1", "2"]).unwrap();
        run(&["mtp-session", "playlist", "add", &playlist_id, "2"]).unwrap();
        assert!(run(&["mtp-session", "playlist", "add", &playlist_id, "77"]).is_err());

        let session = manager.connect_one().unwrap();
        assert_eq!(session.albums().unwrap()[0].tracks, vec![1, 2]);
        assert_eq!(session.playlists().unwrap()[0].tracks, vec![2]);
    }

    #[test]
    fn test_errors_clear_command() {
        let manager = SessionManager::new(MockTransport::with_devices(vec![MockDeviceSpec::player(
            "Creative", "ZEN",
        )
        .with_error("PTP layer error 02fe")]));

        run_device_command(&manager, &parse(&["mtp-session", "errors"]), &quiet_config(), no_shutdown())
            .unwrap();
        assert_eq!(manager.connect_one().unwrap().errors().unwrap().len(), 1);

        let args = parse(&["mtp-session", "errors", "--clear"]);
        run_device_command(&manager, &args, &quiet_config(), no_shutdown()).unwrap();
        assert!(manager.connect_one().unwrap().errors().unwrap().is_empty());
    }

    #[test]
    fn test_append_tracks_skips_duplicates() {
        let mut tracks = vec![1, 2];
        assert_eq!(append_tracks(&mut tracks, &[2, 3, 3]), 1);
        assert_eq!(tracks, vec![1, 2, 3]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(185_400), "3:05");
    }

    #[test]
    fn test_config_init_to_custom_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");

        let action = ConfigCommands::Init {
            output: Some(path.clone()),
        };
        handle_config_command(&action, &Config::default()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }
}
