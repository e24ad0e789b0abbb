//! The public client facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::operations::Executor;
use crate::pool::PoolRegistry;
use crate::protocol::{file_ext_name, Request, Response};
use crate::sink::DownloadSink;
use crate::types::{FileInfo, GroupStat, Metadata, MetadataFlag, StorageServer, StorageStat};

/// FastDFS client.
///
/// Owns one connection-pool registry shared by every operation; operations
/// run concurrently, each on its own pooled connection. The client is cheap
/// to share behind an [`Arc`].
///
/// # Example
///
/// ```no_run
/// use fastdfs_client::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::from_tracker_addrs(["192.168.1.100:22122"])?;
///     let client = Client::new(config)?;
///
///     let file_id = client.upload_buffer(None, b"hello", "txt", None).await?;
///     let data = client.download_file(&file_id).await?;
///     assert_eq!(&data[..], b"hello");
///     client.delete_file(&file_id).await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    registry: Arc<PoolRegistry>,
    ops: Executor,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Client {
    /// Creates a client. Fails on invalid configuration.
    ///
    /// When called inside a tokio runtime this also starts the periodic
    /// idle-connection sweeper; outside a runtime, sweeping still happens
    /// opportunistically on release.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(PoolRegistry::new(config.clone()));
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(sweeper(
                Arc::downgrade(&registry),
                cancel.clone(),
                config.idle_timeout,
            ));
        }

        let ops = Executor::new(config, registry.clone(), cancel.clone());

        Ok(Self {
            registry,
            ops,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Uploads an in-memory buffer. Pass a group to pin the upload to it.
    /// Returns the new file id.
    pub async fn upload_buffer(
        &self,
        group: Option<&str>,
        data: &[u8],
        ext: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed()?;
        self.ops.upload_buffer(group, data, ext, metadata, false).await
    }

    /// Uploads from an async reader of known length.
    pub async fn upload_stream<R>(
        &self,
        group: Option<&str>,
        payload: &mut R,
        size: u64,
        ext: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.check_closed()?;
        self.ops
            .upload_stream(group, payload, size, ext, metadata, false)
            .await
    }

    /// Uploads a local file, streaming it from disk.
    pub async fn upload_file(
        &self,
        group: Option<&str>,
        local_path: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed()?;
        let mut file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();
        let ext = file_ext_name(local_path);
        self.ops
            .upload_stream(group, &mut file, size, &ext, metadata, false)
            .await
    }

    /// Uploads an appender file from a buffer; the result can be appended
    /// to, modified, and truncated later.
    pub async fn upload_appender_buffer(
        &self,
        group: Option<&str>,
        data: &[u8],
        ext: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed()?;
        self.ops.upload_buffer(group, data, ext, metadata, true).await
    }

    /// Uploads an appender file from an async reader of known length.
    pub async fn upload_appender_stream<R>(
        &self,
        group: Option<&str>,
        payload: &mut R,
        size: u64,
        ext: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.check_closed()?;
        self.ops
            .upload_stream(group, payload, size, ext, metadata, true)
            .await
    }

    /// Uploads a local file as an appender file.
    pub async fn upload_appender_file(
        &self,
        group: Option<&str>,
        local_path: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed()?;
        let mut file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();
        let ext = file_ext_name(local_path);
        self.ops
            .upload_stream(group, &mut file, size, &ext, metadata, true)
            .await
    }

    /// Uploads a slave file next to an existing master file. The slave's
    /// name derives from the master's, the prefix, and the extension.
    pub async fn upload_slave_buffer(
        &self,
        master_file_id: &str,
        prefix: &str,
        ext: &str,
        data: &[u8],
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed()?;
        self.ops
            .upload_slave_buffer(master_file_id, prefix, ext, data, metadata)
            .await
    }

    /// Downloads a whole file into memory.
    pub async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        self.check_closed()?;
        self.ops.download(file_id, 0, 0).await
    }

    /// Downloads a byte range into memory. `length` of 0 means to the end.
    pub async fn download_file_range(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.check_closed()?;
        self.ops.download(file_id, offset, length).await
    }

    /// Streams a download into a sink without buffering the body.
    /// Returns the number of bytes streamed.
    pub async fn download_to_sink<S>(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        self.check_closed()?;
        self.ops.download_to_sink(file_id, offset, length, sink).await
    }

    /// Streams a download onto disk. Returns the number of bytes written.
    pub async fn download_to_file(&self, file_id: &str, local_path: &str) -> Result<u64> {
        self.check_closed()?;
        self.ops.download_to_file(file_id, local_path).await
    }

    /// Appends a buffer to an appender file.
    pub async fn append_buffer(&self, file_id: &str, data: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.ops.append_buffer(file_id, data).await
    }

    /// Appends from an async reader of known length to an appender file.
    pub async fn append_stream<R>(&self, file_id: &str, payload: &mut R, size: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.check_closed()?;
        self.ops.append_stream(file_id, payload, size).await
    }

    /// Overwrites a byte range of an appender file.
    pub async fn modify_buffer(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.ops.modify_buffer(file_id, offset, data).await
    }

    /// Truncates an appender file to `new_size` bytes.
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.check_closed()?;
        self.ops.truncate(file_id, new_size).await
    }

    /// Deletes a file.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.check_closed()?;
        self.ops.delete(file_id).await
    }

    /// Sets a file's metadata, overwriting or merging per `flag`.
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.check_closed()?;
        self.ops.set_metadata(file_id, metadata, flag).await
    }

    /// Gets a file's metadata.
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        self.check_closed()?;
        self.ops.get_metadata(file_id).await
    }

    /// Gets a file's size, creation time, CRC32, and source server.
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.check_closed()?;
        self.ops.file_info(file_id).await
    }

    /// Whether a file exists. Any failure counts as "no".
    pub async fn file_exists(&self, file_id: &str) -> bool {
        self.check_closed().is_ok() && self.ops.file_info(file_id).await.is_ok()
    }

    /// Lists all groups' stats.
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        self.check_closed()?;
        self.ops.list_groups().await
    }

    /// Lists the storage servers of one group, optionally narrowed to one
    /// server's IP.
    pub async fn list_storages(
        &self,
        group: &str,
        storage_ip: Option<&str>,
    ) -> Result<Vec<StorageStat>> {
        self.check_closed()?;
        self.ops.list_storages(group, storage_ip).await
    }

    /// Asks a tracker for an upload target. Returns the assigned group and
    /// the storage server that would receive the upload.
    pub async fn query_storage(&self, group: Option<&str>) -> Result<(String, StorageServer)> {
        self.check_closed()?;
        self.ops.query_storage(group).await
    }

    /// Asks a tracker which storage server holds a file.
    pub async fn query_fetch(&self, file_id: &str) -> Result<StorageServer> {
        self.check_closed()?;
        let (group, path) = crate::protocol::split_file_id(file_id)?;
        self.ops.query_fetch(&group, &path).await
    }

    /// Executes one buffered request and returns the raw response.
    /// See [`Request`] for which commands are self-routing.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.check_closed()?;
        self.ops.execute(request).await
    }

    /// Closes the client: cancels in-flight operations and drops idle
    /// connections. Idempotent; operations after close fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing client");
        self.cancel.cancel();
        self.registry.clear();
    }
}

/// Periodically evicts idle connections until the client closes or is
/// dropped.
async fn sweeper(registry: Weak<PoolRegistry>, cancel: CancellationToken, idle_timeout: Duration) {
    let period = idle_timeout.max(Duration::from_secs(1)) / 2;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else { break };
                registry.sweep_all();
            }
        }
    }
}
