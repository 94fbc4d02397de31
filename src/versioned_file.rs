//! Files with a rotating history of previous versions.
//!
//! Writing `profile.json` keeps the previous contents as
//! `profile.000.json`, the one before that as `profile.001.json`, and so
//! on up to the configured version count. Writes go to a temporary file
//! first and replace the current file only once complete, so a crash
//! mid-write never leaves a truncated current file.

use crate::error::{PubSubError, ResultExt, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Number of previous versions kept when not configured otherwise
pub const DEFAULT_VERSION_COUNT: usize = 10;

fn tagged_path(path: &Path, tag: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{}.{}", stem, tag, ext),
        _ => format!("{}.{}", file_name, tag),
    };
    path.with_file_name(name)
}

/// Path of version `n` (0 = most recent previous version).
pub fn version_path(path: &Path, n: usize) -> PathBuf {
    tagged_path(path, &format!("{:03}", n))
}

fn tmp_path(path: &Path) -> PathBuf {
    tagged_path(path, &format!("tmp_{}", std::process::id()))
}

/// Existing previous versions, most recent first.
pub fn versions(path: &Path) -> Vec<PathBuf> {
    (0..)
        .map(|n| version_path(path, n))
        .take_while(|p| p.is_file())
        .collect()
}

fn highest_version(path: &Path) -> Option<usize> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = fs::read_dir(&dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let candidate = e.path();
            // Parse the NNN tag back out by regenerating the name
            let name = candidate.file_name()?.to_str()?.to_string();
            let tag = name.split('.').rev().nth(1)?;
            let n: usize = tag.parse().ok()?;
            (tag.len() >= 3 && version_path(path, n) == candidate).then_some(n)
        })
        .max()
}

/// Write `contents` to `path`, rotating the previous contents into the
/// version history. `version_count` of 0 keeps no history.
pub fn write(path: &Path, contents: &[u8], version_count: usize) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, contents).with_context(|| format!("writing {:?}", tmp))?;

    let top = highest_version(path).map_or(0, |n| n + 1);
    for n in (0..=top).rev() {
        let dst = version_path(path, n);
        if dst.is_file() {
            fs::remove_file(&dst).with_context(|| format!("removing {:?}", dst))?;
        }
        let src = if n == 0 {
            path.to_path_buf()
        } else {
            version_path(path, n - 1)
        };
        if n < version_count && src.is_file() {
            fs::rename(&src, &dst).with_context(|| format!("rotating {:?}", src))?;
        }
    }
    fs::rename(&tmp, path).with_context(|| format!("replacing {:?}", path))?;
    tracing::debug!("Wrote {:?} ({} bytes)", path, contents.len());
    Ok(())
}

/// Discard the current file and the `count - 1` most recent versions,
/// restoring version `count - 1` as current. Older versions shift down.
///
/// Returns false when no such version exists; the current file is then
/// left untouched.
pub fn revert(path: &Path, count: usize) -> Result<bool> {
    if count == 0 {
        return Err(PubSubError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "revert count must be at least 1",
        )));
    }
    if !version_path(path, count - 1).is_file() {
        return Ok(false);
    }
    if path.is_file() {
        fs::remove_file(path).with_context(|| format!("removing {:?}", path))?;
    }
    for n in 0..count - 1 {
        let p = version_path(path, n);
        if p.is_file() {
            fs::remove_file(&p).with_context(|| format!("removing {:?}", p))?;
        }
    }
    let mut dst = path.to_path_buf();
    let mut n = count - 1;
    loop {
        let src = version_path(path, n);
        if !src.is_file() {
            break;
        }
        fs::rename(&src, &dst).with_context(|| format!("restoring {:?}", src))?;
        dst = version_path(path, n + 1 - count);
        n += 1;
    }
    tracing::debug!("Reverted {:?} by {} version(s)", path, count);
    Ok(true)
}

/// Remove the file and all of its versions.
pub fn remove(path: &Path) -> Result<()> {
    if path.is_file() {
        fs::remove_file(path).with_context(|| format!("removing {:?}", path))?;
    }
    for p in versions(path) {
        fs::remove_file(&p).with_context(|| format!("removing {:?}", p))?;
    }
    Ok(())
}
