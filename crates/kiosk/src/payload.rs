//! Staging of the application payload shipped with a create request.
//!
//! The payload arrives base64-encoded in the request body, is decoded and
//! validated here, written under the configured data directory, and
//! bind-mounted read-only into the instance container. The staged file is
//! removed when the instance is torn down.

use std::path::{Path, PathBuf};

use base64::Engine;
use thiserror::Error;
use tracing::warn;

/// Ceiling on the decoded payload size.
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("payload is empty")]
    Empty,

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    TooLarge(usize),
}

/// Decode and validate a base64 payload.
pub fn decode(payload_b64: &str) -> Result<Vec<u8>, PayloadError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload_b64)?;
    if bytes.is_empty() {
        return Err(PayloadError::Empty);
    }
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(PayloadError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn staged_path(data_dir: &Path, instance_id: &str) -> PathBuf {
    data_dir.join(format!("{instance_id}.bin"))
}

/// Write the decoded payload for an instance, returning the staged path.
pub fn write(data_dir: &Path, instance_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let path = staged_path(data_dir, instance_id);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Remove an instance's staged payload. Best effort: a missing file is fine,
/// anything else is logged and swallowed so teardown keeps going.
pub fn remove(data_dir: &Path, instance_id: &str) {
    let path = staged_path(data_dir, instance_id);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove staged payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_roundtrip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        assert_eq!(decode(&encoded).unwrap(), b"hello");
    }

    #[test]
    fn rejects_garbage_and_empty() {
        assert!(matches!(decode("not base64!!"), Err(PayloadError::Decode(_))));
        assert!(matches!(decode(""), Err(PayloadError::Empty)));
    }

    #[test]
    fn write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "abc", b"data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        remove(dir.path(), "abc");
        assert!(!path.exists());

        // Removing again is a no-op.
        remove(dir.path(), "abc");
    }
}
