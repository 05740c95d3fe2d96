use crate::common::timestamp_utils;
use crate::errors::AppError;
use log::debug;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_NAME_BYTES: usize = 255;

pub fn generate_timestamped_filename(
    base_name: &str,      // e.g., camera name
    timestamp_format: &str, // from config, e.g., "%Y%m%d_%H%M%S"
    extension: &str,      // e.g., "png"
) -> String {
    let timestamp = timestamp_utils::current_local_timestamp_str(timestamp_format);
    format!("{}_{}.{}", sanitize_component(base_name), timestamp, extension)
}

pub fn ensure_output_directory(dir_path: &Path) -> Result<PathBuf, AppError> {
    if !dir_path.exists() {
        debug!("Output directory '{}' does not exist, attempting to create it.", dir_path.display());
        fs::create_dir_all(dir_path).map_err(|e| {
            AppError::Io(format!(
                "Failed to create output directory '{}': {}",
                dir_path.display(),
                e
            ))
        })?;
    } else if !dir_path.is_dir() {
        return Err(AppError::Io(format!(
            "Output path '{}' exists but is not a directory.",
            dir_path.display()
        )));
    }
    Ok(dir_path.to_path_buf())
}

/// Checks that `name` can be used verbatim as a single directory name.
pub fn validate_session_name(name: &str) -> Result<(), AppError> {
    let reject = |reason: &str| {
        Err(AppError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if name.len() > MAX_NAME_BYTES {
        return reject("name is longer than 255 bytes");
    }
    if name == "." || name == ".." {
        return reject("name is a relative path component");
    }
    if name.trim() != name {
        return reject("name has leading or trailing whitespace");
    }
    if name.ends_with('.') {
        return reject("name ends with a dot");
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return reject(&format!("name contains reserved character '{}'", c));
    }
    if name.chars().any(char::is_control) {
        return reject("name contains control characters");
    }
    Ok(())
}

/// Writes `bytes` to `path` and flushes them to the device before returning.
pub fn write_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Like [`write_durable`] but fails if `path` already exists.
pub fn write_new_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Replaces `path` with `bytes` so readers see either the old or the new
/// contents, never a torn write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    write_durable(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Moves `src` into `dest_dir`, keeping its file name unless that is taken,
/// in which case a timestamp suffix is appended.
pub fn move_into_unique(src: &Path, dest_dir: &Path) -> std::io::Result<PathBuf> {
    let file_name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;

    let mut target = dest_dir.join(&file_name);
    if target.exists() {
        let stamp = timestamp_utils::current_local_timestamp_str("%Y%m%d-%H%M%S");
        let mut attempt = 0u32;
        loop {
            let candidate = if attempt == 0 {
                format!("{}-{}", file_name, stamp)
            } else {
                format!("{}-{}-{}", file_name, stamp, attempt)
            };
            target = dest_dir.join(candidate);
            if !target.exists() {
                break;
            }
            attempt += 1;
        }
    }
    fs::rename(src, &target)?;
    Ok(target)
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if RESERVED_CHARS.contains(&c) || c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect()
}
