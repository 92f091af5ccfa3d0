//! Image copy planner.
//!
//! Decides per storage volume whether the destination is already current and,
//! if not, copies it. Copies are written to a hidden temporary file in the
//! destination directory and renamed over the final name only once complete,
//! so a reader of the backup tree never sees a half-written image under its
//! real name.

use serde::Serialize;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::CompareMode;

/// Bytes moved per read/write cycle; cancellation is checked between chunks.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Suffix of in-flight copies.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Errors raised while planning or copying a single volume.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("copy cancelled")]
    Cancelled,
}

impl CopyError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> CopyError + '_ {
        move |source| CopyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What the planner decided for a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyAction {
    /// Destination already matches the source.
    Skip,
    /// Source must be copied.
    Copy,
}

/// Outcome of planning (and possibly copying) one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyDecision {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub action: CopyAction,
    /// Bytes written; zero for skipped volumes and dry runs.
    pub bytes_copied: u64,
}

/// Decide whether `source` needs to be copied to `dest`, without copying.
pub fn plan(
    source: &Path,
    dest: &Path,
    skip_if_same: bool,
    compare: CompareMode,
) -> Result<CopyAction, CopyError> {
    let source_meta = fs::metadata(source).map_err(CopyError::io(source))?;
    if !source_meta.is_file() {
        return Err(CopyError::NotAFile(source.to_path_buf()));
    }

    if skip_if_same && is_identical(source, &source_meta, dest, compare)? {
        return Ok(CopyAction::Skip);
    }

    Ok(CopyAction::Copy)
}

/// Plan a volume and copy it when needed.
#[instrument(skip_all, fields(source = %source.display(), dest = %dest.display()))]
pub fn plan_and_copy(
    source: &Path,
    dest: &Path,
    skip_if_same: bool,
    compare: CompareMode,
    cancel: &CancellationToken,
) -> Result<CopyDecision, CopyError> {
    let action = plan(source, dest, skip_if_same, compare)?;

    let bytes_copied = match action {
        CopyAction::Skip => {
            info!("Destination is identical, skipping copy");
            0
        }
        CopyAction::Copy => copy_atomic(source, dest, cancel)?,
    };

    Ok(CopyDecision {
        source: source.to_path_buf(),
        dest: dest.to_path_buf(),
        action,
        bytes_copied,
    })
}

/// Whether `dest` already holds the same content as `source`.
fn is_identical(
    source: &Path,
    source_meta: &Metadata,
    dest: &Path,
    compare: CompareMode,
) -> Result<bool, CopyError> {
    let dest_meta = match fs::metadata(dest) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CopyError::io(dest)(e)),
    };

    if !dest_meta.is_file() || dest_meta.len() != source_meta.len() {
        return Ok(false);
    }

    match compare {
        CompareMode::Metadata => match (source_meta.modified(), dest_meta.modified()) {
            (Ok(src), Ok(dst)) => Ok(src == dst),
            // No mtime support on this filesystem; never assume equality
            _ => Ok(false),
        },
        CompareMode::Checksum => {
            let same = hash_file(source)? == hash_file(dest)?;
            debug!(same, "Compared BLAKE3 digests");
            Ok(same)
        }
    }
}

fn hash_file(path: &Path) -> Result<blake3::Hash, CopyError> {
    let mut file = File::open(path).map_err(CopyError::io(path))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(CopyError::io(path))?;
    Ok(hasher.finalize())
}

/// Copy through a temporary file and rename into place.
///
/// The temporary file is removed on every error path (it is owned by a
/// `NamedTempFile` until persisted). The finished copy carries the source's
/// permissions and modification time, which is what `CompareMode::Metadata`
/// relies on for the next run.
fn copy_atomic(source: &Path, dest: &Path, cancel: &CancellationToken) -> Result<u64, CopyError> {
    let dir = dest
        .parent()
        .ok_or_else(|| CopyError::NotAFile(dest.to_path_buf()))?;
    let name = dest
        .file_name()
        .ok_or_else(|| CopyError::NotAFile(dest.to_path_buf()))?
        .to_string_lossy()
        .into_owned();

    let mut input = File::open(source).map_err(CopyError::io(source))?;
    let source_meta = input.metadata().map_err(CopyError::io(source))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)
        .map_err(CopyError::io(dir))?;

    info!(size_bytes = source_meta.len(), "Copying image");

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::io(source)(e)),
        };

        tmp.write_all(&buf[..n]).map_err(CopyError::io(tmp.path()))?;
        copied += n as u64;

        if cancel.is_cancelled() {
            debug!(copied, "Copy interrupted, discarding partial file");
            return Err(CopyError::Cancelled);
        }
    }

    let file = tmp.as_file();
    file.set_permissions(source_meta.permissions())
        .map_err(CopyError::io(tmp.path()))?;
    if let Ok(mtime) = source_meta.modified() {
        file.set_modified(mtime).map_err(CopyError::io(tmp.path()))?;
    }
    file.sync_all().map_err(CopyError::io(tmp.path()))?;

    tmp.persist(dest).map_err(|e| CopyError::Io {
        path: dest.to_path_buf(),
        source: e.error,
    })?;

    info!(bytes = copied, "Image copied");
    Ok(copied)
}

/// Write a small file atomically (temporary file + rename).
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<(), CopyError> {
    let dir = path
        .parent()
        .ok_or_else(|| CopyError::NotAFile(path.to_path_buf()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".vmbackup.")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)
        .map_err(CopyError::io(dir))?;

    tmp.write_all(content).map_err(CopyError::io(tmp.path()))?;
    tmp.as_file().sync_all().map_err(CopyError::io(tmp.path()))?;
    tmp.persist(path).map_err(|e| CopyError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}
