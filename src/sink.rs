//! Destinations for streamed response bodies.
//!
//! The protocol engine hands download bytes to a [`DownloadSink`] chunk by
//! chunk, calls `complete` exactly once after the last chunk, and `release`
//! on abort. A sink must never drop bytes: once a write fails, the sink is
//! poisoned and every later write fails too, which makes the engine break
//! the connection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{Error, Result};

/// A writable destination for a streamed download.
#[async_trait]
pub trait DownloadSink: Send {
    /// Accepts the next chunk. Called in arrival order.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Called exactly once after the last chunk of a successful download.
    async fn complete(&mut self) -> Result<()>;

    /// Called when the download aborts; drops buffered state.
    async fn release(&mut self);
}

/// Collects a download into memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: BytesMut,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the sink and returns the collected bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Bytes collected so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[async_trait]
impl DownloadSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) {
        self.buf.clear();
    }
}

/// Streams a download onto disk.
///
/// Chunks go through a bounded queue drained by one writer task, so network
/// reads are not blocked by disk latency; when the writer lags, the full
/// queue blocks the producer instead of growing.
pub struct FileSink {
    path: PathBuf,
    tx: Option<mpsc::Sender<Bytes>>,
    worker: Option<JoinHandle<std::io::Result<()>>>,
    poisoned: bool,
}

impl FileSink {
    /// Creates the target file (and missing parent directories) and starts
    /// the writer task. `queue_chunks` bounds how many chunks may sit
    /// between the network and the disk.
    pub async fn create(path: impl AsRef<Path>, queue_chunks: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = File::create(&path).await?;

        let (tx, mut rx) = mpsc::channel::<Bytes>(queue_chunks.max(1));
        let worker = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        });

        Ok(Self {
            path,
            tx: Some(tx),
            worker: Some(worker),
            poisoned: false,
        })
    }

    /// The path this sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn worker_error(&mut self) -> Error {
        match self.worker.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Error::Stream("file writer stopped early".into()),
                Ok(Err(e)) => Error::Stream(format!("writing {}: {}", self.path.display(), e)),
                Err(e) => Error::Stream(format!("file writer panicked: {}", e)),
            },
            None => Error::Stream("file writer already gone".into()),
        }
    }
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if self.poisoned {
            return Err(Error::Stream("sink already failed".into()));
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(Error::Stream("sink already completed".into()));
        };
        if tx.send(chunk).await.is_err() {
            // the writer task bailed out; surface its I/O error
            self.poisoned = true;
            self.tx = None;
            return Err(self.worker_error().await);
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.tx = None; // closing the queue lets the writer finish and flush
        match self.worker.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    self.poisoned = true;
                    Err(Error::Stream(format!(
                        "writing {}: {}",
                        self.path.display(),
                        e
                    )))
                }
                Err(e) => {
                    self.poisoned = true;
                    Err(Error::Stream(format!("file writer panicked: {}", e)))
                }
            },
            None => Ok(()),
        }
    }

    async fn release(&mut self) {
        self.tx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.await;
        }
        debug!(path = %self.path.display(), "download sink released");
    }
}
