//! NDJSON event archive.
//!
//! One file per `(tenant_id, project_id, date)`: one event JSON object per
//! line, `ts` ascending, terminated by a trailing
//! `{"_checksum": "<hex-sha256-of-preceding-bytes>"}` line. Retention can
//! move cold events here without losing the replay-rebuild guarantee; the
//! replay engine validates each file's checksum before applying it.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::events::{Event, Scope};

/// Errors from archive reading or writing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// Filesystem error.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file has no trailing checksum line.
    #[error("archive {path} is missing its trailing checksum line")]
    MissingChecksum {
        /// The offending file.
        path: String,
    },

    /// The trailing checksum does not match the preceding bytes.
    #[error("archive {path} failed checksum validation")]
    ChecksumMismatch {
        /// The offending file.
        path: String,
    },

    /// A line failed to parse as an event.
    #[error("archive {path} line {line}: {source}")]
    Malformed {
        /// The offending file.
        path: String,
        /// 1-based line number.
        line: usize,
        /// The parse failure.
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct ChecksumLine {
    #[serde(rename = "_checksum")]
    checksum: String,
}

/// The archive file name for a scope and `YYYY-MM-DD` date.
#[must_use]
pub fn file_name(scope: &Scope, date: &str) -> String {
    format!("{}__{}__{date}.ndjson", scope.tenant_id, scope.project_id)
}

/// Writes events (already `ts`-ascending) as one archive file.
///
/// Returns the written path.
///
/// # Errors
///
/// Returns an error on serialization or filesystem failure.
pub fn write_file(
    dir: &Path,
    scope: &Scope,
    date: &str,
    events: &[Event],
) -> Result<PathBuf, ArchiveError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name(scope, date));

    let mut body = Vec::new();
    for event in events {
        let line = serde_json::to_string(event).map_err(|source| ArchiveError::Malformed {
            path: path.display().to_string(),
            line: 0,
            source,
        })?;
        body.extend_from_slice(line.as_bytes());
        body.push(b'\n');
    }
    let checksum = hex::encode(Sha256::digest(&body));

    let mut file = fs::File::create(&path)?;
    file.write_all(&body)?;
    writeln!(file, "{{\"_checksum\": \"{checksum}\"}}")?;
    file.sync_all()?;
    Ok(path)
}

/// Reads an archive file, validating the trailing checksum.
///
/// # Errors
///
/// - [`ArchiveError::MissingChecksum`] when the trailing line is absent.
/// - [`ArchiveError::ChecksumMismatch`] when the bytes do not hash to it.
/// - [`ArchiveError::Malformed`] when an event line fails to parse.
pub fn read_file(path: &Path) -> Result<Vec<Event>, ArchiveError> {
    let display = path.display().to_string();
    let bytes = fs::read(path)?;

    // The checksum line is the last non-empty line; everything before its
    // start is what it covers.
    let trimmed_len = bytes
        .iter()
        .rposition(|b| *b != b'\n')
        .map_or(0, |idx| idx + 1);
    let body_end = bytes[..trimmed_len]
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let checksum_line = &bytes[body_end..trimmed_len];
    let parsed: ChecksumLine = serde_json::from_slice(checksum_line).map_err(|_| {
        ArchiveError::MissingChecksum {
            path: display.clone(),
        }
    })?;

    let expected = hex::encode(Sha256::digest(&bytes[..body_end]));
    if parsed.checksum != expected {
        return Err(ArchiveError::ChecksumMismatch { path: display });
    }

    let mut events = Vec::new();
    for (idx, line) in bytes[..body_end].split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let event: Event =
            serde_json::from_slice(line).map_err(|source| ArchiveError::Malformed {
                path: display.clone(),
                line: idx + 1,
                source,
            })?;
        events.push(event);
    }
    Ok(events)
}

/// Lists a directory's archive files for one scope, in chronological order
/// (the date suffix makes lexicographic order chronological).
///
/// # Errors
///
/// Returns an error when the directory cannot be read.
pub fn list_files(dir: &Path, scope: &Scope) -> Result<Vec<PathBuf>, ArchiveError> {
    let prefix = format!("{}__{}__", scope.tenant_id, scope.project_id);
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "ndjson")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    paths.sort();
    Ok(paths)
}
