//! JSON snapshot files.
//!
//! Writes go to a temporary file in the target directory which is synced and
//! then renamed over the destination, so a reader never sees a half-written
//! snapshot. Reads treat a missing file as "nothing saved yet" but reject a
//! file that is empty or not valid JSON.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::errors::PersistError;

fn io_error(path: &Path, source: io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Read and decode a JSON snapshot.
///
/// # Arguments
/// * `path` - The snapshot file.
///
/// # Returns
/// `Ok(None)` if the file does not exist, the decoded value otherwise.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Snapshot {} does not exist yet", path.display());
            return Ok(None);
        }
        Err(e) => return Err(io_error(path, e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(PersistError::Empty(path.to_path_buf()));
    }

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Atomically replace `path` with the JSON encoding of `value`.
///
/// # Arguments
/// * `path` - Destination file. Missing parent directories are created.
/// * `value` - The value to write.
///
/// # Returns
/// An error if any step fails; the destination is then left untouched.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(|e| io_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;

    // Make the rename itself durable where the platform allows it.
    if let Ok(dir) = File::open(&dir) {
        let _ = dir.sync_all();
    }
    debug!("Wrote snapshot {}", path.display());
    Ok(())
}
