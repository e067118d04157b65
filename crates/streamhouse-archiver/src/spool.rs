//! Local buffer spool.
//!
//! Payloads received between flushes are appended to a single local file,
//! newline-terminated, and uploaded as one object. Only the message ids and
//! the publish-time range are kept in memory, so memory grows with the number
//! of buffered messages rather than their size.
//!
//! ## Lifecycle
//!
//! ```text
//! create ─→ append* ─→ (sync ─→ upload ─→ flush_reset ─→ append*)* ─→ destroy
//! ```
//!
//! `create` removes any stale file left at the same path by an earlier
//! invocation that was killed before it could clean up.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::traits::MessageId;

const RECORD_DELIMITER: &[u8] = b"\n";

/// Exclusively-owned append-only spool file.
#[derive(Debug)]
pub struct BufferSpool {
    path: PathBuf,
    file: Option<File>,
    byte_size: u64,
    ids: Vec<MessageId>,
    first_publish_ms: Option<u64>,
    last_publish_ms: Option<u64>,
}

impl BufferSpool {
    /// Create an empty spool at `path`, replacing any stale file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match tokio::fs::remove_file(&path).await {
            Ok(()) => warn!(path = ?path, "Removed stale spool file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        debug!(path = ?path, "Spool created");

        Ok(Self {
            path,
            file: Some(file),
            byte_size: 0,
            ids: Vec::new(),
            first_publish_ms: None,
            last_publish_ms: None,
        })
    }

    /// Append one payload and return the new total size in bytes.
    pub async fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let file = self.file_mut()?;
        file.write_all(payload).await?;
        file.write_all(RECORD_DELIMITER).await?;
        file.flush().await?;
        self.byte_size += (payload.len() + RECORD_DELIMITER.len()) as u64;
        Ok(self.byte_size)
    }

    /// Remember that `id` is now part of the spool.
    pub fn record(&mut self, id: MessageId, publish_time_ms: u64) {
        self.ids.push(id);
        self.first_publish_ms.get_or_insert(publish_time_ms);
        self.last_publish_ms = Some(publish_time_ms);
    }

    /// Force the spool contents to disk before it is uploaded.
    pub async fn sync(&mut self) -> Result<()> {
        self.file_mut()?.sync_data().await?;
        Ok(())
    }

    /// Truncate to zero length and forget buffered ids; the file stays open.
    pub async fn flush_reset(&mut self) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        file.set_len(0).await?;
        file.sync_data().await?;

        self.byte_size = 0;
        self.ids.clear();
        self.first_publish_ms = None;
        self.last_publish_ms = None;

        debug!(path = ?self.path, "Spool reset");
        Ok(())
    }

    /// Close and remove the file.
    pub async fn destroy(mut self) -> Result<()> {
        // Dropping the handle closes it before the unlink.
        self.file.take();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = ?self.path, "Spool deleted");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Buffered ids in the order they were received.
    pub fn ids(&self) -> &[MessageId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first_publish_ms(&self) -> Option<u64> {
        self.first_publish_ms
    }

    pub fn last_publish_ms(&self) -> Option<u64> {
        self.last_publish_ms
    }

    fn file_mut(&mut self) -> std::io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spool file is closed")
        })
    }
}
