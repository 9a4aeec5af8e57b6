//! Filesystem helpers for producing the output tree.
//!
//! Writes and copies create missing parent directories on demand: the first
//! attempt is made directly, and only a `NotFound` failure triggers
//! `create_dir_all` followed by a single retry.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Write `data` to `path`, creating parent directories if needed.
pub async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    match fs::write(path, data).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_parent(path).await?;
            fs::write(path, data).await
        }
        result => result,
    }
}

/// Copy `src` to `dst`, creating parent directories of `dst` if needed.
pub async fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    match fs::copy(src, dst).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound && fs::metadata(src).await.is_ok() => {
            create_parent(dst).await?;
            fs::copy(src, dst).await
        }
        result => result,
    }
}

/// Whether `dst` is missing or older than `src`.
pub async fn is_stale(src: &Path, dst: &Path) -> io::Result<bool> {
    let src_time = fs::metadata(src).await?.modified()?;
    let dst_time = match fs::metadata(dst).await.and_then(|m| m.modified()) {
        Ok(time) => time,
        Err(_) => SystemTime::UNIX_EPOCH,
    };
    Ok(dst_time < src_time)
}

/// Recreate the symlink `src` at `dst`, pointing at the same target.
///
/// An existing link at `dst` with the same target is left alone; anything
/// else at `dst` is replaced once.
#[cfg(unix)]
pub async fn copy_symlink(src: &Path, dst: &Path) -> io::Result<PathBuf> {
    let target = fs::read_link(src).await?;
    let mut retried = false;
    loop {
        match fs::symlink(&target, dst).await {
            Ok(()) => return Ok(target),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if fs::read_link(dst).await.is_ok_and(|existing| existing == target) {
                    return Ok(target);
                }
                if retried {
                    return Err(e);
                }
                let _ = fs::remove_file(dst).await;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !retried => {
                create_parent(dst).await?;
            }
            Err(e) => return Err(e),
        }
        retried = true;
    }
}

#[cfg(not(unix))]
pub async fn copy_symlink(src: &Path, _dst: &Path) -> io::Result<PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot copy symlink {}", src.display()),
    ))
}

/// Resolve `rel` against `base` lexically, collapsing `.` and `..`.
///
/// Absolute `rel` paths are returned cleaned but otherwise unchanged.
pub fn resolve(base: &Path, rel: impl AsRef<Path>) -> PathBuf {
    let joined = base.join(rel);
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}
