//! The build / archive / keep directory trio.
//!
//! Each run works inside `.mash`. At startup the previous run's `.mash` is
//! rotated into `.mash-archive`, entry by entry, so the archive always holds
//! the previous attempt. Reuse decisions (`save`, `recall`) copy archive
//! entries back while preserving their modification times, which is what
//! keeps downstream `recall`s truthful.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;

pub const BUILD_DIR: &str = ".mash";
pub const ARCHIVE_DIR: &str = ".mash-archive";

#[derive(Debug, Clone)]
pub struct Workspace {
    origin: PathBuf,
    build: PathBuf,
    archive: PathBuf,
}

impl Workspace {
    pub fn new(origin: PathBuf) -> Self {
        let build = origin.join(BUILD_DIR);
        let archive = origin.join(ARCHIVE_DIR);
        Self {
            origin,
            build,
            archive,
        }
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn build(&self) -> &Path {
        &self.build
    }

    /// Resolve a script-relative path against the build directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.build.join(path)
    }

    /// The archive entry corresponding to a build-relative target.
    pub fn archive_entry(&self, target: &str) -> PathBuf {
        self.archive.join(target)
    }

    /// Move every entry of the build directory into the archive, replacing
    /// same-named entries, then leave a fresh build directory behind.
    pub fn rotate(&self) -> Result<()> {
        if self.build.exists() {
            tracing::debug!("rotating {} into {}", self.build.display(), self.archive.display());
            fs::create_dir_all(&self.archive).context("Failed to create the archive directory")?;
            for entry in fs::read_dir(&self.build).context("Failed to read the build directory")? {
                let entry = entry?;
                let target = self.archive.join(entry.file_name());
                remove_entry(&target)?;
                fs::rename(entry.path(), &target).with_context(|| {
                    format!("Failed to archive '{}'", entry.path().display())
                })?;
            }
        } else {
            fs::create_dir_all(&self.build).context("Failed to create the build directory")?;
        }
        Ok(())
    }

    /// Remove both the build and the archive directory (`-c`).
    pub fn clean(&self) -> Result<()> {
        for dir in [&self.build, &self.archive] {
            if dir.exists() {
                tracing::info!("removing {}", dir.display());
                fs::remove_dir_all(dir)
                    .with_context(|| format!("Failed to remove '{}'", dir.display()))?;
            }
        }
        Ok(())
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory '{}'", path.display()))?;
    } else if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove '{}'", path.display()))?;
    }
    Ok(())
}

/// Copy a file, carrying its access and modification times over.
pub(crate) fn copy_preserving(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    fs::copy(src, dest).with_context(|| {
        format!(
            "Failed to copy '{}' to '{}'",
            src.display(),
            dest.display()
        )
    })?;
    let meta = fs::metadata(src)?;
    set_times(dest, meta.accessed()?, meta.modified()?)
}

/// Copy a directory tree, replacing any existing target.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    remove_entry(dest)?;
    fs::create_dir_all(dest).with_context(|| format!("Failed to create '{}'", dest.display()))?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            copy_preserving(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy a file or a directory, whichever `src` is.
pub(crate) fn copy_entry(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        copy_tree(src, dest)
    } else {
        copy_preserving(src, dest)
    }
}

pub(crate) fn set_times(path: &Path, accessed: SystemTime, modified: SystemTime) -> Result<()> {
    utimensat(
        None,
        path,
        &timespec(accessed)?,
        &timespec(modified)?,
        UtimensatFlags::FollowSymlink,
    )
    .with_context(|| format!("Failed to set times on '{}'", path.display()))
}

fn timespec(time: SystemTime) -> Result<TimeSpec> {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .context("Timestamp predates the epoch")?;
    Ok(TimeSpec::new(
        since_epoch.as_secs() as i64,
        since_epoch.subsec_nanos() as i64,
    ))
}

pub(crate) fn mtime(path: &Path) -> Result<SystemTime> {
    Ok(fs::metadata(path)
        .with_context(|| format!("Failed to stat '{}'", path.display()))?
        .modified()?)
}

/// Compare two byte streams without loading either into memory.
pub(crate) fn contents_equal<A, B>(mut reader1: A, mut reader2: B) -> bool
where
    A: Read,
    B: Read,
{
    let mut buf1 = [0; 1024];
    let mut buf2 = [0; 1024];

    loop {
        let len1 = match reader1.read(&mut buf1) {
            Ok(len) => len,
            Err(_) => break false,
        };
        let mut filled = 0;
        // The second reader may hand data back in smaller chunks.
        while filled < len1 {
            match reader2.read(&mut buf2[filled..len1]) {
                Ok(0) => return false,
                Ok(len) => filled += len,
                Err(_) => return false,
            }
        }
        if buf1[..len1] != buf2[..len1] {
            break false;
        }
        if len1 == 0 {
            // Both ends reached only if the second reader is finished too.
            break matches!(reader2.read(&mut buf2[..1]), Ok(0));
        }
    }
}

/// Does `path` hold exactly these bytes?
pub(crate) fn file_equals(path: &Path, contents: &[u8]) -> bool {
    match File::open(path) {
        Ok(file) => contents_equal(file, contents),
        Err(_) => false,
    }
}
