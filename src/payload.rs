//! Bulk upload payloads.
//!
//! Uploads are flat little-endian arrays of fixed-width integers. They are
//! written to a scratch file, handed to [`Transport::send_file`], and the file
//! is removed when the [`ScratchFile`] goes out of scope, whatever the outcome.
//!
//! [`Transport::send_file`]: crate::transport::Transport::send_file

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::AppResult;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Builder for a flat little-endian payload.
#[derive(Debug, Default)]
pub struct BulkPayload {
    buf: BytesMut,
}

impl BulkPayload {
    /// Empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(bytes),
        }
    }

    /// Append one 8-byte signed word.
    pub fn push_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Append one 4-byte signed sample.
    pub fn push_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Payload written to disk, removed on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `payload` to a fresh file in `dir`.
    pub fn create(dir: &Path, stem: &str, payload: BulkPayload) -> AppResult<Self> {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}-{}-{}.dat", stem, std::process::id(), n));
        let bytes = payload.freeze();
        std::fs::write(&path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "wrote scratch payload");
        Ok(Self { path })
    }

    /// Location of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove scratch payload: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_little_endian() {
        let mut payload = BulkPayload::new();
        payload.push_i64(-2);
        payload.push_i32(0x0102_0304);
        let bytes = payload.freeze();
        assert_eq!(&bytes[..8], &(-2i64).to_le_bytes());
        assert_eq!(&bytes[8..], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_scratch_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut payload = BulkPayload::with_capacity(8);
        payload.push_i64(1);

        let scratch = ScratchFile::create(dir.path(), "coeffs", payload).unwrap();
        let path = scratch.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap().len(), 8);
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_file_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(ScratchFile::create(&missing, "coeffs", BulkPayload::new()).is_err());
    }
}
