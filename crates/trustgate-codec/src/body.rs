//! Spooled message bodies.
//!
//! Decoded bodies stay in memory up to a threshold and spill to a temporary
//! file beyond it. The file is deleted when the body is released or dropped.

use crate::digest::{DigestAlgorithm, Digester};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default in-memory limit before a body is written to disk.
pub const DEFAULT_SPOOL_THRESHOLD: usize = 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

enum Storage {
    Memory(Bytes),
    File(NamedTempFile),
    Released,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            Self::File(file) => write!(f, "File({})", file.path().display()),
            Self::Released => f.write_str("Released"),
        }
    }
}

/// A received body together with its digest.
#[derive(Debug)]
pub struct SpooledBody {
    content_type: String,
    len: u64,
    digest: Vec<u8>,
    storage: Storage,
}

impl SpooledBody {
    /// Builds an in-memory body, computing its digest.
    pub fn from_bytes(content_type: impl Into<String>, data: Bytes, algorithm: DigestAlgorithm) -> Self {
        Self {
            content_type: content_type.into(),
            len: data.len() as u64,
            digest: algorithm.digest(&data),
            storage: Storage::Memory(data),
        }
    }

    /// Original content type of the payload.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Digest computed while the body was received.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Whether the body was written to a temporary file.
    pub fn is_spooled(&self) -> bool {
        matches!(self.storage, Storage::File(_))
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the spool file cannot be read or the body was
    /// already released.
    pub async fn read_all(&self) -> io::Result<Bytes> {
        match &self.storage {
            Storage::Memory(bytes) => Ok(bytes.clone()),
            Storage::File(file) => tokio::fs::read(file.path()).await.map(Bytes::from),
            Storage::Released => Err(released()),
        }
    }

    /// Turns the body into a chunk stream. A spool file lives until the
    /// stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the spool file cannot be reopened or the body
    /// was already released.
    pub fn into_stream(mut self) -> io::Result<BoxStream<'static, io::Result<Bytes>>> {
        match std::mem::replace(&mut self.storage, Storage::Released) {
            Storage::Memory(bytes) => Ok(stream::once(async move { Ok(bytes) }).boxed()),
            Storage::File(file) => {
                let reader = tokio::fs::File::from_std(file.reopen()?);
                Ok(stream::unfold(Some((reader, file)), |state| async move {
                    let (mut reader, file) = state?;
                    let mut buf = BytesMut::zeroed(READ_CHUNK);
                    match reader.read(&mut buf).await {
                        Ok(0) => None,
                        Ok(n) => {
                            buf.truncate(n);
                            Some((Ok(buf.freeze()), Some((reader, file))))
                        }
                        Err(e) => Some((Err(e), None)),
                    }
                })
                .boxed())
            }
            Storage::Released => Err(released()),
        }
    }

    /// Frees the memory or deletes the spool file. Idempotent.
    pub fn release(&mut self) {
        if let Storage::File(file) = std::mem::replace(&mut self.storage, Storage::Released) {
            if let Err(e) = file.close() {
                tracing::warn!(error = %e, "failed to delete body spool file");
            }
        }
    }
}

fn released() -> io::Error {
    io::Error::other("body already released")
}

/// Accumulates a body while it is received, digesting as it goes.
pub struct BodySpooler {
    threshold: usize,
    digester: Digester,
    buffer: BytesMut,
    file: Option<(NamedTempFile, tokio::fs::File)>,
    len: u64,
}

impl BodySpooler {
    pub fn new(algorithm: DigestAlgorithm, threshold: usize) -> Self {
        Self {
            threshold,
            digester: algorithm.digester(),
            buffer: BytesMut::new(),
            file: None,
            len: 0,
        }
    }

    /// Appends a chunk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the spool file cannot be created or written.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.digester.update(chunk);
        self.len += chunk.len() as u64;
        if let Some((_, writer)) = self.file.as_mut() {
            return writer.write_all(chunk).await;
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.threshold {
            let file = NamedTempFile::new()?;
            let mut writer = tokio::fs::File::from_std(file.reopen()?);
            writer.write_all(&self.buffer).await?;
            self.buffer = BytesMut::new();
            tracing::debug!(path = %file.path().display(), "body spooled to disk");
            self.file = Some((file, writer));
        }
        Ok(())
    }

    /// Completes the body.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the spool file cannot be flushed.
    pub async fn finish(self, content_type: impl Into<String>) -> io::Result<SpooledBody> {
        let storage = match self.file {
            Some((file, mut writer)) => {
                writer.flush().await?;
                writer.sync_all().await?;
                Storage::File(file)
            }
            None => Storage::Memory(self.buffer.freeze()),
        };
        Ok(SpooledBody {
            content_type: content_type.into(),
            len: self.len,
            digest: self.digester.finalize(),
            storage,
        })
    }
}
