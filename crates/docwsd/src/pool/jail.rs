//! Per-worker jail construction.
//!
//! A jail is a fresh directory under the child root populated from the system
//! template and the application template. Files are hard-linked where
//! possible so building a jail costs little more than walking the templates.
//!
//! Jails are never removed. A respawned worker builds a new one, so the child
//! root grows with every respawn.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use super::error::JailError;
use super::privilege::{Capability, PrivilegeController};

/// Where jails live and what goes into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailSpec {
    pub child_root: PathBuf,
    pub sys_template: PathBuf,
    pub app_template: PathBuf,
    /// Location of the application tree inside the jail.
    pub app_subpath: PathBuf,
}

/// A populated jail.
#[derive(Debug, Clone)]
pub struct Jail {
    pub id: u64,
    pub root: PathBuf,
    pub app_dir: PathBuf,
}

/// Counters from one template walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub linked: usize,
    pub copied: usize,
    pub directories: usize,
    pub skipped: usize,
}

/// How a single file landed at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Linked,
    Copied,
}

/// Random odd identifier, used both as worker id and jail directory name.
pub fn new_jail_id() -> u64 {
    rand::random::<u64>() | 1
}

impl JailSpec {
    /// Create and populate `<child_root>/<id>`.
    ///
    /// Fails if the directory already exists, so two workers can never share
    /// a jail.
    pub fn build(&self, id: u64) -> Result<Jail, JailError> {
        fs::create_dir_all(&self.child_root)
            .map_err(|e| JailError::io("create", &self.child_root, e))?;

        let root = self.child_root.join(id.to_string());
        fs::create_dir(&root).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => JailError::Exists(root.clone()),
            _ => JailError::io("create", &root, e),
        })?;

        let app_dir = root.join(&self.app_subpath);
        fs::create_dir_all(&app_dir).map_err(|e| JailError::io("create", &app_dir, e))?;

        let system = link_or_copy(&self.sys_template, &root)?;
        let app = link_or_copy(&self.app_template, &app_dir)?;
        info!(
            "Jail {} populated: system {:?}, application {:?}",
            root.display(),
            system,
            app
        );

        create_random_devices(&root);

        Ok(Jail { id, root, app_dir })
    }
}

/// Mirror `source` into `destination`.
///
/// Regular files and symlinks are hard-linked, falling back to a copy when
/// linking is impossible (different filesystem, for one). Directories are
/// created and get the source's access and modification times. Symlinks
/// whose target does not exist are skipped.
pub fn link_or_copy(source: &Path, destination: &Path) -> Result<LinkStats, JailError> {
    let mut stats = LinkStats::default();

    // Contents first, so a directory's times are restored after its entries
    // have been added.
    for entry in WalkDir::new(source).contents_first(true) {
        let entry = entry.map_err(|e| JailError::Walk {
            path: source.to_path_buf(),
            source: e,
        })?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) if relative.as_os_str().is_empty() => continue,
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| JailError::io("create", &target, e))?;
            copy_times(entry.path(), &target)?;
            stats.directories += 1;
            continue;
        }

        if file_type.is_symlink() && fs::metadata(entry.path()).is_err() {
            debug!("Skipping dangling symlink {}", entry.path().display());
            stats.skipped += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| JailError::io("create", parent, e))?;
        }
        match link_or_copy_file(entry.path(), &target)
            .map_err(|e| JailError::io("link", &target, e))?
        {
            Placement::Linked => stats.linked += 1,
            Placement::Copied => stats.copied += 1,
        }
    }

    Ok(stats)
}

/// Hard-link one file, copying it if the link fails.
pub fn link_or_copy_file(source: &Path, destination: &Path) -> io::Result<Placement> {
    match fs::hard_link(source, destination) {
        Ok(()) => Ok(Placement::Linked),
        Err(link_err) => {
            debug!(
                "link {} -> {} failed ({}), copying",
                source.display(),
                destination.display(),
                link_err
            );
            if fs::symlink_metadata(source)?.file_type().is_symlink() {
                let target = fs::read_link(source)?;
                std::os::unix::fs::symlink(target, destination)?;
            } else {
                fs::copy(source, destination)?;
            }
            Ok(Placement::Copied)
        }
    }
}

fn copy_times(source: &Path, target: &Path) -> Result<(), JailError> {
    let metadata = fs::metadata(source).map_err(|e| JailError::io("stat", source, e))?;
    let accessed = metadata
        .accessed()
        .map_err(|e| JailError::io("stat", source, e))?;
    let modified = metadata
        .modified()
        .map_err(|e| JailError::io("stat", source, e))?;
    let times = FileTimes::new()
        .set_accessed(accessed)
        .set_modified(modified);
    File::open(target)
        .and_then(|dir| dir.set_times(times))
        .map_err(|e| JailError::io("utime", target, e))
}

/// Create `dev/random` and `dev/urandom` inside the jail.
///
/// Needs CAP_MKNOD; without it the jail is usable but lacks the devices, so
/// failures are only logged.
#[cfg(target_os = "linux")]
fn create_random_devices(root: &Path) {
    use rustix::fs::{CWD, FileType, Mode, makedev, mknodat};

    let dev = root.join("dev");
    if let Err(e) = fs::create_dir_all(&dev) {
        warn!("Could not create {}: {}", dev.display(), e);
        return;
    }
    for (name, minor) in [("random", 8), ("urandom", 9)] {
        let path = dev.join(name);
        if let Err(e) = mknodat(
            CWD,
            &path,
            FileType::CharacterDevice,
            Mode::from_raw_mode(0o666),
            makedev(1, minor),
        ) {
            warn!("mknod({}) failed: {}", path.display(), e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn create_random_devices(_root: &Path) {}

/// Make `root` the process root and drop the right to do it again.
///
/// Capabilities are per thread: call this before any other thread exists.
pub fn enter(root: &Path, privileges: &dyn PrivilegeController) -> Result<(), JailError> {
    std::os::unix::fs::chroot(root).map_err(|e| JailError::io("chroot", root, e))?;
    std::env::set_current_dir("/").map_err(|e| JailError::io("chdir", "/", e))?;
    info!("Entered jail {}", root.display());
    privileges.drop_privileges(Capability::SysChroot)?;
    Ok(())
}
