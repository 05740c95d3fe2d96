use crate::errors::AppError;
use log::debug;
use std::fs::{self, File};
use std::io::{self, Cursor, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::task;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

// Already-compressed media gains nothing from deflate.
const STORED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "mp4", "mkv", "webm"];

fn zip_error(context: &str, e: zip::result::ZipError) -> AppError {
    AppError::Io(format!("{}: {}", context, e))
}

/// Collects every file below `dir` as (relative name, path), sorted by name.
fn collect_entries(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(dir)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            entries.push((relative, path));
        }
    }
    entries.sort();
    Ok(entries)
}

/// Writes a zip of everything inside `session_dir` into `writer`. Entry names
/// are relative to the session directory.
pub fn write_archive<W: Write + Seek>(session_dir: &Path, writer: W) -> Result<W, AppError> {
    let mut zip = ZipWriter::new(writer);

    for (name, path) in collect_entries(session_dir)? {
        let is_media = Path::new(&name)
            .extension()
            .map(|ext| STORED_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        let method = if is_media {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        zip.start_file(name.as_str(), SimpleFileOptions::default().compression_method(method))
            .map_err(|e| zip_error(&format!("failed to add '{}'", name), e))?;
        let mut source = File::open(&path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish().map_err(|e| zip_error("failed to finish archive", e))
}

/// Archives `session_dir` into the file `dest`. Returns the archive size.
pub async fn archive_to_file(session_dir: PathBuf, dest: PathBuf) -> Result<u64, AppError> {
    task::spawn_blocking(move || -> Result<u64, AppError> {
        let start = Instant::now();
        let tmp = dest.with_extension("zip.part");
        let result = File::create(&tmp)
            .map_err(AppError::from)
            .and_then(|file| write_archive(&session_dir, file))
            .and_then(|file| file.sync_all().map_err(AppError::from));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &dest)?;
        let size = fs::metadata(&dest)?.len();
        debug!(
            "📦 Archived '{}' to '{}' ({} bytes) in {:?}",
            session_dir.display(),
            dest.display(),
            size,
            start.elapsed()
        );
        Ok(size)
    })
    .await
    .map_err(|e| AppError::Unexpected(format!("archive task failed: {}", e)))?
}

/// Archives `session_dir` in memory.
pub async fn archive_to_bytes(session_dir: PathBuf) -> Result<Vec<u8>, AppError> {
    task::spawn_blocking(move || {
        write_archive(&session_dir, Cursor::new(Vec::new())).map(Cursor::into_inner)
    })
    .await
    .map_err(|e| AppError::Unexpected(format!("archive task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn session_dir(root: &Path) -> PathBuf {
        let dir = root.join("t1");
        fs::create_dir_all(dir.join("frames")).unwrap();
        fs::write(dir.join("metadata.json"), br#"{"snaps":2}"#).unwrap();
        fs::write(dir.join("frames/000000.png"), b"frame0").unwrap();
        fs::write(dir.join("frames/000001.png"), b"frame1").unwrap();
        dir
    }

    #[tokio::test]
    async fn archive_contains_session_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = session_dir(root.path());
        let bytes = archive_to_bytes(dir).await.unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["frames/000000.png", "frames/000001.png", "metadata.json"]);

        let mut contents = String::new();
        zip.by_name("frames/000001.png").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "frame1");
    }

    #[tokio::test]
    async fn archive_file_is_written_outside_session() {
        let root = tempfile::tempdir().unwrap();
        let dir = session_dir(root.path());
        let dest = root.path().join("t1.zip");
        let size = archive_to_file(dir.clone(), dest.clone()).await.unwrap();

        assert_eq!(size, fs::metadata(&dest).unwrap().len());
        assert!(!root.path().join("t1.zip.part").exists());
        assert!(dir.join("frames/000000.png").exists());
    }

    #[tokio::test]
    async fn missing_session_dir_fails() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("ghost.zip");
        assert!(archive_to_file(root.path().join("ghost"), dest.clone()).await.is_err());
        assert!(!dest.exists());
    }
}
