//! Streaming tar unpacker.

use std::ffi::CString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::{FileTime, set_file_times, set_symlink_file_times};
use flate2::read::GzDecoder;
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace};

use crate::errors::{StrataError, StrataResult};
use crate::idmap::map_id;
use crate::unpack::{OPAQUE_WHITEOUT, UnpackOutput, UnpackSpec, Unpacker, WHITEOUT_PREFIX};

pub struct TarUnpacker;

impl TarUnpacker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TarUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

impl Unpacker for TarUnpacker {
    fn unpack(&self, spec: UnpackSpec) -> StrataResult<UnpackOutput> {
        let UnpackSpec {
            stream,
            target_path,
            base_directory,
            uid_mappings,
            gid_mappings,
            whiteout_device_path,
        } = spec;
        let mut stream = stream;

        // Gzip magic: 0x1f 0x8b. Peek two bytes, then stitch them back in
        // front of the stream.
        let mut magic = [0u8; 2];
        let peeked = read_up_to(&mut stream, &mut magic)?;
        let rejoined: Box<dyn Read> =
            Box::new(io::Cursor::new(magic[..peeked].to_vec()).chain(stream));

        let reader: Box<dyn Read> = if magic == [0x1f, 0x8b] {
            debug!("detected gzip-compressed layer");
            Box::new(GzDecoder::new(rejoined))
        } else {
            debug!("detected uncompressed layer");
            rejoined
        };

        let context = UnpackContext {
            target_path,
            base_directory,
            uid_mappings,
            gid_mappings,
            whiteout_device_path,
        };
        apply_layer(reader, &context)
    }
}

/// Everything but the byte stream of an `UnpackSpec`.
struct UnpackContext {
    target_path: PathBuf,
    base_directory: String,
    uid_mappings: Vec<crate::idmap::IdMapping>,
    gid_mappings: Vec<crate::idmap::IdMapping>,
    whiteout_device_path: PathBuf,
}

struct DirMeta {
    path: PathBuf,
    mode: u32,
    mtime: i64,
}

struct DeferredHardlink {
    link_path: PathBuf,
    target_path: PathBuf,
    uid: u32,
    gid: u32,
}

fn apply_layer<R: Read>(reader: R, spec: &UnpackContext) -> StrataResult<UnpackOutput> {
    let base_prefix = spec.base_directory.trim_start_matches('/');
    let root = spec.target_path.join(base_prefix);
    fs::create_dir_all(&root).map_err(|e| {
        StrataError::Backend(format!("creating unpack root {}: {}", root.display(), e))
    })?;

    // Ownership can only be applied with privilege: either real root, or
    // namespace root inside the re-exec child, where chown failures mean
    // the mappings cannot express the layer.
    let is_root = unsafe { libc::geteuid() } == 0;

    let mut archive = Archive::new(reader);
    let mut output = UnpackOutput::default();
    let mut deferred_dirs: Vec<DirMeta> = Vec::new();
    let mut deferred_hardlinks: Vec<DeferredHardlink> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| StrataError::Unpackable(format!("reading tar entries: {}", e)))?;

    for entry_result in entries {
        let mut entry =
            entry_result.map_err(|e| StrataError::Unpackable(format!("reading tar entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| StrataError::Unpackable(format!("parsing tar header path: {}", e)))?
            .into_owned();

        let Some(normalized) = normalize_entry_path(&raw_path) else {
            debug!(path = %raw_path.display(), "skipping-path-outside-root");
            continue;
        };
        if normalized.as_os_str().is_empty() {
            continue;
        }

        let full_path = root.join(&normalized);
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o755);
        let uid = map_id(&spec.uid_mappings, entry.header().uid().unwrap_or(0) as u32);
        let gid = map_id(&spec.gid_mappings, entry.header().gid().unwrap_or(0) as u32);
        let mtime = entry.header().mtime().unwrap_or(0) as i64;
        let size = entry.header().size().unwrap_or(0) as i64;
        let device_major = entry.header().device_major().unwrap_or(None).unwrap_or(0);
        let device_minor = entry.header().device_minor().unwrap_or(None).unwrap_or(0);

        trace!(
            path = %normalized.display(),
            ?entry_type,
            mode,
            uid,
            gid,
            "unpacking-entry"
        );

        if entry_type == EntryType::Regular
            && handle_whiteout(&full_path, base_prefix, &normalized, &mut output)?
        {
            continue;
        }

        output.bytes_written += size;

        ensure_parent_dirs(&full_path, &root)?;
        remove_existing_if_needed(&full_path, entry_type)?;

        match entry_type {
            EntryType::Directory => {
                create_dir(&full_path)?;
                if is_root {
                    lchown(&full_path, uid, gid)?;
                }
                // Directory modes and times are finalized after the walk:
                // children still need to be written through them, and every
                // write bumps the mtime. The explicit chmod at the end also
                // keeps the process umask out of the layer.
                deferred_dirs.push(DirMeta {
                    path: full_path.clone(),
                    mode,
                    mtime,
                });
            }
            EntryType::Regular | EntryType::GNUSparse => {
                create_regular_file(&mut entry, &full_path, mode)?;
                if is_root {
                    lchown(&full_path, uid, gid)?;
                }
                apply_mode_and_times(&full_path, mode, mtime)?;
            }
            EntryType::Link => {
                let target = link_target(&mut entry, &raw_path)?;
                let target_path = resolve_hardlink_target(&root, &target)?;
                if target_path.exists() {
                    create_hardlink(&full_path, &target_path)?;
                } else {
                    trace!(
                        link = %full_path.display(),
                        target = %target_path.display(),
                        "deferring-hardlink"
                    );
                    deferred_hardlinks.push(DeferredHardlink {
                        link_path: full_path.clone(),
                        target_path,
                        uid,
                        gid,
                    });
                }
            }
            EntryType::Symlink => {
                let target = link_target(&mut entry, &raw_path)?;
                std::os::unix::fs::symlink(&target, &full_path).map_err(|e| {
                    StrataError::Backend(format!(
                        "creating symlink {} -> {}: {}",
                        full_path.display(),
                        target.display(),
                        e
                    ))
                })?;
                if is_root {
                    lchown(&full_path, uid, gid)?;
                }
                let time = FileTime::from_unix_time(mtime, 0);
                set_symlink_file_times(&full_path, time, time).map_err(|e| {
                    StrataError::Backend(format!(
                        "setting times on symlink {}: {}",
                        full_path.display(),
                        e
                    ))
                })?;
            }
            EntryType::Block | EntryType::Char => {
                create_device(
                    &full_path,
                    entry_type,
                    mode,
                    device_major,
                    device_minor,
                    &spec.whiteout_device_path,
                )?;
            }
            EntryType::Fifo => {
                create_fifo(&full_path, mode)?;
                if is_root {
                    lchown(&full_path, uid, gid)?;
                }
            }
            EntryType::XGlobalHeader | EntryType::XHeader => {
                trace!(path = %raw_path.display(), "ignoring-pax-header");
            }
            other => {
                return Err(StrataError::Unpackable(format!(
                    "unhandled tar entry type {:?} for {}",
                    other,
                    raw_path.display()
                )));
            }
        }
    }

    // Targets may have appeared after the link entry; anything still missing
    // was removed by a whiteout and is skipped.
    for deferred in deferred_hardlinks {
        if deferred.target_path.exists() {
            create_hardlink(&deferred.link_path, &deferred.target_path)?;
            if is_root {
                lchown(&deferred.link_path, deferred.uid, deferred.gid)?;
            }
        } else {
            trace!(
                link = %deferred.link_path.display(),
                target = %deferred.target_path.display(),
                "skipping-deferred-hardlink"
            );
        }
    }

    // Deepest-first so a restrictive parent mode cannot block its children.
    deferred_dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
    for dir in &deferred_dirs {
        if !dir.path.exists() {
            continue;
        }
        apply_mode_and_times(&dir.path, dir.mode, dir.mtime)?;
    }

    Ok(output)
}

/// Returns true when the entry was a whiteout marker and has been consumed.
fn handle_whiteout(
    full_path: &Path,
    base_prefix: &str,
    normalized: &Path,
    output: &mut UnpackOutput,
) -> StrataResult<bool> {
    let Some(base_name) = full_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };

    if base_name == OPAQUE_WHITEOUT {
        // Record for the driver; the marker itself is never materialized.
        let marker = Path::new(base_prefix).join(normalized);
        output
            .opaque_whiteouts
            .push(marker.to_string_lossy().into_owned());
        return Ok(true);
    }

    if let Some(target_name) = base_name.strip_prefix(WHITEOUT_PREFIX) {
        let parent = full_path.parent().ok_or_else(|| {
            StrataError::Unpackable("whiteout entry without parent directory".to_string())
        })?;
        let target = parent.join(target_name);
        match fs::symlink_metadata(&target) {
            Ok(metadata) => {
                if metadata.is_dir() {
                    fs::remove_dir_all(&target)
                } else {
                    fs::remove_file(&target)
                }
                .map_err(|e| {
                    StrataError::Backend(format!(
                        "removing whiteout target {}: {}",
                        target.display(),
                        e
                    ))
                })?;
                debug!(target = %target.display(), "whiteout-removed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StrataError::Backend(format!(
                    "inspecting whiteout target {}: {}",
                    target.display(),
                    e
                )));
            }
        }
        return Ok(true);
    }

    Ok(false)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> StrataResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(StrataError::Unpackable(format!("reading layer stream: {}", e)));
            }
        }
    }
    Ok(filled)
}

fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => continue,
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

fn ensure_parent_dirs(path: &Path, root: &Path) -> StrataResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent == root || parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::create_dir_all(parent) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => {
            // A lower layer left a non-directory where this layer expects a
            // directory chain. Remove the obstacle and retry.
            let mut obstacle = parent;
            while let Some(candidate) = obstacle.parent() {
                if candidate == root {
                    break;
                }
                match fs::symlink_metadata(obstacle) {
                    Ok(m) if !m.is_dir() => break,
                    _ => obstacle = candidate,
                }
            }
            if let Ok(m) = fs::symlink_metadata(obstacle) {
                if !m.is_dir() {
                    trace!(path = %obstacle.display(), "removing-non-directory-obstacle");
                    fs::remove_file(obstacle).map_err(|e| {
                        StrataError::Backend(format!(
                            "removing obstacle {}: {}",
                            obstacle.display(),
                            e
                        ))
                    })?;
                }
            }
            fs::create_dir_all(parent).map_err(|e| {
                StrataError::Backend(format!("creating parent {}: {}", parent.display(), e))
            })
        }
        Err(e) => Err(StrataError::Backend(format!(
            "creating parent {}: {}",
            parent.display(),
            e
        ))),
    }
}

fn remove_existing_if_needed(path: &Path, entry_type: EntryType) -> StrataResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_dir() && entry_type == EntryType::Directory {
                return Ok(());
            }
            fs::remove_file(path)
                .or_else(|_| fs::remove_dir_all(path))
                .map_err(|e| {
                    StrataError::Backend(format!(
                        "removing existing path {}: {}",
                        path.display(),
                        e
                    ))
                })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::Backend(format!(
            "inspecting {}: {}",
            path.display(),
            e
        ))),
    }
}

fn create_dir(path: &Path) -> StrataResult<()> {
    if !path.exists() {
        fs::create_dir(path).map_err(|e| {
            permission_error(e, path, format!("creating directory {}", path.display()))
        })?;
    }
    Ok(())
}

fn create_regular_file<R: Read>(entry: &mut Entry<R>, path: &Path, mode: u32) -> StrataResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| permission_error(e, path, format!("creating file {}", path.display())))?;

    io::copy(entry, &mut file).map_err(|e| {
        StrataError::Backend(format!("writing file data to {}: {}", path.display(), e))
    })?;
    Ok(())
}

fn create_hardlink(path: &Path, target: &Path) -> StrataResult<()> {
    fs::hard_link(target, path).map_err(|e| {
        StrataError::Backend(format!(
            "creating hardlink {} -> {}: {}",
            path.display(),
            target.display(),
            e
        ))
    })
}

fn link_target<R: Read>(entry: &mut Entry<R>, raw_path: &Path) -> StrataResult<PathBuf> {
    entry
        .link_name()
        .map_err(|e| StrataError::Unpackable(format!("reading tar link name: {}", e)))?
        .map(|p| p.into_owned())
        .ok_or_else(|| {
            StrataError::Unpackable(format!("link entry without target: {}", raw_path.display()))
        })
}

fn resolve_hardlink_target(root: &Path, linkname: &Path) -> StrataResult<PathBuf> {
    let cleaned = normalize_entry_path(linkname).ok_or_else(|| {
        StrataError::Unpackable(format!(
            "hardlink target escapes root: {}",
            linkname.display()
        ))
    })?;
    Ok(root.join(cleaned))
}

fn create_device(
    path: &Path,
    entry_type: EntryType,
    mode: u32,
    major: u32,
    minor: u32,
    whiteout_device: &Path,
) -> StrataResult<()> {
    if unsafe { libc::geteuid() } != 0 {
        // Device nodes cannot be created without privilege; stand in a link
        // to the store's reserved placeholder device.
        if whiteout_device.exists() {
            fs::hard_link(whiteout_device, path).map_err(|e| {
                StrataError::Backend(format!(
                    "linking whiteout device for {}: {}",
                    path.display(),
                    e
                ))
            })?;
        } else {
            trace!(path = %path.display(), "skipping-device-node");
        }
        return Ok(());
    }

    let dev = libc::makedev(major, minor);
    let kind = match entry_type {
        EntryType::Block => libc::S_IFBLK,
        EntryType::Char => libc::S_IFCHR,
        _ => unreachable!(),
    };
    let full_mode = kind | (mode & 0o7777);

    let c_path = to_cstring(path)?;
    let res = unsafe { libc::mknod(c_path.as_ptr(), full_mode, dev) };
    if res != 0 {
        let err = io::Error::last_os_error();
        return Err(permission_error(
            err,
            path,
            format!("creating device {}", path.display()),
        ));
    }
    Ok(())
}

fn create_fifo(path: &Path, mode: u32) -> StrataResult<()> {
    let c_path = to_cstring(path)?;
    let res = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if res != 0 {
        let err = io::Error::last_os_error();
        return Err(permission_error(
            err,
            path,
            format!("creating fifo {}", path.display()),
        ));
    }
    Ok(())
}

fn apply_mode_and_times(path: &Path, mode: u32, mtime: i64) -> StrataResult<()> {
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        StrataError::Backend(format!("setting mode on {}: {}", path.display(), e))
    })?;
    let time = FileTime::from_unix_time(mtime, 0);
    set_file_times(path, time, time).map_err(|e| {
        StrataError::Backend(format!("setting times on {}: {}", path.display(), e))
    })
}

fn lchown(path: &Path, uid: u32, gid: u32) -> StrataResult<()> {
    let c_path = to_cstring(path)?;
    let res = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if res == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    Err(permission_error(
        err,
        path,
        format!("changing ownership of {} to {}:{}", path.display(), uid, gid),
    ))
}

/// Permission failures while materializing a layer mean the configured
/// mappings cannot express the layer's ownership on this host.
fn permission_error(err: io::Error, path: &Path, context: String) -> StrataError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        StrataError::Unpackable(format!(
            "{}: {} - this image may require ID-mapped unpacking; initialize the store \
             with uid/gid mappings or run as root",
            context, err
        ))
    } else {
        StrataError::Backend(format!("{}: {} ({})", context, err, path.display()))
    }
}

fn to_cstring(path: &Path) -> StrataResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        StrataError::Backend(format!("path contains interior NUL: {}", path.display()))
    })
}
