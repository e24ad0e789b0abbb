//! Operation orchestration.
//!
//! Every high-level operation is a fixed composition of exchanges: ask a
//! tracker which storage server to talk to, then run the storage command
//! there. The executor owns the pool registry, picks trackers in
//! configuration order, and races every step against the client's
//! cancellation token.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::errors::{Error, Result};
use crate::pool::PoolRegistry;
use crate::protocol::{
    decode_fetch_server, decode_file_info, decode_group_stats, decode_metadata,
    decode_query_store, decode_storage_stats, decode_upload_reply, join_file_id, split_file_id,
    Request, Response,
};
use crate::sink::{DownloadSink, FileSink, MemorySink};
use crate::types::{
    FileInfo, GroupStat, Metadata, MetadataFlag, ServerRole, StorageServer, StorageStat,
};

/// Runs operations against the cluster. Used through [`crate::Client`].
pub struct Executor {
    config: Arc<ClientConfig>,
    registry: Arc<PoolRegistry>,
    cancel: CancellationToken,
}

impl Executor {
    /// Creates an executor over a pool registry.
    pub fn new(
        config: Arc<ClientConfig>,
        registry: Arc<PoolRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            cancel,
        }
    }

    /// Races a future against the client's cancellation token.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    /// Runs one buffered exchange against the trackers, in configuration
    /// order. A connect failure falls through to the next tracker; any other
    /// error is final.
    async fn tracker_exchange(&self, request: &Request) -> Result<Response> {
        let mut last_err = None;
        for tracker in &self.config.trackers {
            let pool = self.registry.pool(tracker);
            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(e) if e.is_connect_failure() => {
                    warn!(tracker = %tracker, error = %e, "tracker unreachable, trying next");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let result = conn.exchange(request).await;
            pool.release(conn);
            return result;
        }
        Err(last_err.unwrap_or_else(|| Error::Config("tracker list is empty".into())))
    }

    fn storage_endpoint(server: &StorageServer) -> Endpoint {
        Endpoint::new(server.ip_addr.clone(), server.port)
    }

    /// Runs one buffered exchange against a storage server.
    async fn storage_exchange(&self, server: &StorageServer, request: &Request) -> Result<Response> {
        let pool = self.registry.pool(&Self::storage_endpoint(server));
        let mut conn = pool.acquire().await?;
        let result = conn.exchange(request).await;
        pool.release(conn);
        result
    }

    /// Runs one storage exchange that streams a request payload.
    async fn storage_exchange_with_payload<R>(
        &self,
        server: &StorageServer,
        request: &Request,
        payload: &mut R,
    ) -> Result<Response>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pool = self.registry.pool(&Self::storage_endpoint(server));
        let mut conn = pool.acquire().await?;
        let result = conn.exchange_with_payload(request, payload).await;
        pool.release(conn);
        result
    }

    /// Runs one storage exchange that streams the response into a sink.
    async fn storage_exchange_to_sink<S>(
        &self,
        server: &StorageServer,
        request: &Request,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        let pool = self.registry.pool(&Self::storage_endpoint(server));
        let mut conn = pool.acquire().await?;
        let result = conn.exchange_to_sink(request, sink).await;
        pool.release(conn);
        result
    }

    /// Asks a tracker for an upload target, optionally within a group.
    /// Returns the assigned group and the storage server to upload to.
    pub async fn query_storage(&self, group: Option<&str>) -> Result<(String, StorageServer)> {
        let request = match group {
            Some(group) => Request::QueryStoreWithGroup {
                group: group.to_string(),
            },
            None => Request::QueryStoreWithoutGroup,
        };
        let response = self.tracker_exchange(&request).await?;
        decode_query_store(&response.body, self.config.charset)
    }

    /// Asks a tracker which storage server holds `group/path`.
    pub async fn query_fetch(&self, group: &str, path: &str) -> Result<StorageServer> {
        let request = Request::QueryFetchOne {
            group: group.to_string(),
            path: path.to_string(),
        };
        let response = self.tracker_exchange(&request).await?;
        decode_fetch_server(&response.body, self.config.charset)
    }

    /// Asks a tracker which storage server owns `group/path` for mutation.
    pub async fn query_update(&self, group: &str, path: &str) -> Result<StorageServer> {
        let request = Request::QueryUpdate {
            group: group.to_string(),
            path: path.to_string(),
        };
        let response = self.tracker_exchange(&request).await?;
        decode_fetch_server(&response.body, self.config.charset)
    }

    /// Uploads from an async reader whose exact length is known up front.
    pub async fn upload_stream<R>(
        &self,
        group: Option<&str>,
        payload: &mut R,
        size: u64,
        ext: &str,
        metadata: Option<&Metadata>,
        appender: bool,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.cancellable(async {
            let (assigned_group, server) = self.query_storage(group).await?;
            debug!(group = %assigned_group, server = %server.ip_addr, size, "uploading");

            let request = Request::Upload {
                store_path_index: server.store_path_index,
                ext: ext.to_string(),
                size,
                appender,
            };
            let response = self
                .storage_exchange_with_payload(&server, &request, payload)
                .await?;
            let (group, path) = decode_upload_reply(&response.body, self.config.charset)?;
            let file_id = join_file_id(&group, &path);

            if let Some(metadata) = metadata {
                if !metadata.is_empty() {
                    self.set_metadata_inner(&file_id, metadata, MetadataFlag::Overwrite)
                        .await?;
                }
            }

            Ok(file_id)
        })
        .await
    }

    /// Uploads an in-memory buffer.
    pub async fn upload_buffer(
        &self,
        group: Option<&str>,
        data: &[u8],
        ext: &str,
        metadata: Option<&Metadata>,
        appender: bool,
    ) -> Result<String> {
        let mut reader = data;
        self.upload_stream(group, &mut reader, data.len() as u64, ext, metadata, appender)
            .await
    }

    /// Uploads a slave file next to an existing master file.
    pub async fn upload_slave_buffer(
        &self,
        master_file_id: &str,
        prefix: &str,
        ext: &str,
        data: &[u8],
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.cancellable(async {
            let (group, master_path) = split_file_id(master_file_id)?;
            let server = self.query_update(&group, &master_path).await?;

            let request = Request::UploadSlave {
                master_path,
                prefix: prefix.to_string(),
                ext: ext.to_string(),
                size: data.len() as u64,
            };
            let mut reader = data;
            let response = self
                .storage_exchange_with_payload(&server, &request, &mut reader)
                .await?;
            let (group, path) = decode_upload_reply(&response.body, self.config.charset)?;
            let file_id = join_file_id(&group, &path);

            if let Some(metadata) = metadata {
                if !metadata.is_empty() {
                    self.set_metadata_inner(&file_id, metadata, MetadataFlag::Overwrite)
                        .await?;
                }
            }

            Ok(file_id)
        })
        .await
    }

    /// Downloads a whole file or a byte range into memory.
    pub async fn download(&self, file_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.cancellable(async {
            let mut sink = MemorySink::new();
            self.download_to_sink_inner(file_id, offset, length, &mut sink)
                .await?;
            Ok(sink.into_bytes())
        })
        .await
    }

    /// Streams a download into a caller-supplied sink. Returns the byte count.
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
        self.cancellable(self.download_to_sink_inner(file_id, offset, length, sink))
            .await
    }

    async fn download_to_sink_inner<S>(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        let (group, path) = split_file_id(file_id)?;
        let server = self.query_fetch(&group, &path).await?;
        let request = Request::Download {
            group,
            path,
            offset,
            length,
        };
        self.storage_exchange_to_sink(&server, &request, sink).await
    }

    /// Streams a download onto disk. Returns the byte count.
    pub async fn download_to_file(&self, file_id: &str, local_path: &str) -> Result<u64> {
        let queue_chunks =
            (self.config.write_high_water_mark / self.config.write_low_water_mark).max(2);
        let mut sink = FileSink::create(local_path, queue_chunks).await?;
        self.download_to_sink(file_id, 0, 0, &mut sink).await
    }

    /// Appends bytes to an appender file.
    pub async fn append_stream<R>(&self, file_id: &str, payload: &mut R, size: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_update(&group, &path).await?;
            let request = Request::Append { path, size };
            self.storage_exchange_with_payload(&server, &request, payload)
                .await?;
            Ok(())
        })
        .await
    }

    /// Appends an in-memory buffer to an appender file.
    pub async fn append_buffer(&self, file_id: &str, data: &[u8]) -> Result<()> {
        let mut reader = data;
        self.append_stream(file_id, &mut reader, data.len() as u64)
            .await
    }

    /// Overwrites a byte range of an appender file.
    pub async fn modify_buffer(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_update(&group, &path).await?;
            let request = Request::Modify {
                path,
                offset,
                size: data.len() as u64,
            };
            let mut reader = data;
            self.storage_exchange_with_payload(&server, &request, &mut reader)
                .await?;
            Ok(())
        })
        .await
    }

    /// Truncates an appender file to `new_size` bytes.
    pub async fn truncate(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_update(&group, &path).await?;
            let request = Request::Truncate { path, new_size };
            self.storage_exchange(&server, &request).await?;
            Ok(())
        })
        .await
    }

    /// Deletes a file.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_update(&group, &path).await?;
            let request = Request::Delete { group, path };
            self.storage_exchange(&server, &request).await?;
            Ok(())
        })
        .await
    }

    /// Sets a file's metadata.
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.cancellable(self.set_metadata_inner(file_id, metadata, flag))
            .await
    }

    async fn set_metadata_inner(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let (group, path) = split_file_id(file_id)?;
        let server = self.query_update(&group, &path).await?;
        let request = Request::SetMetadata {
            group,
            path,
            metadata: metadata.clone(),
            flag,
        };
        self.storage_exchange(&server, &request).await?;
        Ok(())
    }

    /// Gets a file's metadata.
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_fetch(&group, &path).await?;
            let request = Request::GetMetadata { group, path };
            let response = self.storage_exchange(&server, &request).await?;
            Ok(decode_metadata(&response.body, self.config.charset))
        })
        .await
    }

    /// Gets a file's size, creation time, and checksum.
    pub async fn file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.cancellable(async {
            let (group, path) = split_file_id(file_id)?;
            let server = self.query_fetch(&group, &path).await?;
            let request = Request::QueryFileInfo { group, path };
            let response = self.storage_exchange(&server, &request).await?;
            decode_file_info(&response.body, self.config.charset)
        })
        .await
    }

    /// Lists all groups' stats.
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        self.cancellable(async {
            let response = self.tracker_exchange(&Request::ListGroups).await?;
            decode_group_stats(&response.body, self.config.charset)
        })
        .await
    }

    /// Lists the storage servers of one group.
    pub async fn list_storages(
        &self,
        group: &str,
        storage_ip: Option<&str>,
    ) -> Result<Vec<StorageStat>> {
        self.cancellable(async {
            let request = Request::ListStorages {
                group: group.to_string(),
                storage_ip: storage_ip.map(str::to_string),
            };
            let response = self.tracker_exchange(&request).await?;
            decode_storage_stats(&response.body, self.config.charset)
        })
        .await
    }

    /// Executes one buffered request and returns the raw response.
    ///
    /// Tracker requests go to the configured trackers. Storage requests that
    /// name their file (`group/path`) are routed through the matching tracker
    /// query first. Payload-bearing commands have no generic form; use the
    /// named operations for those.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.cancellable(async {
            if request.role() == ServerRole::Tracker {
                return self.tracker_exchange(&request).await;
            }

            let server = match &request {
                Request::Download { group, path, .. }
                | Request::GetMetadata { group, path }
                | Request::QueryFileInfo { group, path } => {
                    self.query_fetch(group, path).await?
                }
                Request::Delete { group, path }
                | Request::SetMetadata { group, path, .. } => {
                    self.query_update(group, path).await?
                }
                other => {
                    return Err(Error::Unsupported(format!(
                        "command {} cannot be executed generically",
                        other.command()
                    )))
                }
            };
            self.storage_exchange(&server, &request).await
        })
        .await
    }
}
