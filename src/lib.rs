//! Async Rust client for the FastDFS distributed file system.
//!
//! FastDFS splits a cluster into trackers (metadata/dispatch) and storage
//! servers (bulk content). This crate speaks the binary tracker/storage
//! protocol over pooled TCP connections and exposes the file operations on
//! top of it: upload, download, append, modify, truncate, delete, metadata,
//! and cluster listings.
//!
//! # Features
//!
//! - Upload and download with streamed payloads: file content never has to
//!   be buffered whole
//! - Appender files: append, modify, truncate
//! - Slave files and metadata operations
//! - Per-endpoint connection pooling with idle eviction and acquire deadlines
//! - Tracker failover in configuration order
//! - Cancellation-safe operations via `close()`
//!
//! # Example
//!
//! ```no_run
//! use fastdfs_client::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_tracker_addrs(["192.168.1.100:22122"])?;
//!     let client = Client::new(config)?;
//!
//!     let file_id = client.upload_buffer(None, b"Hello, FastDFS!", "txt", None).await?;
//!     let data = client.download_file(&file_id).await?;
//!     client.delete_file(&file_id).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod operations;
pub mod pool;
pub mod protocol;
pub mod sink;
pub mod types;

pub use client::Client;
pub use config::{Charset, ClientConfig, Endpoint};
pub use errors::{Error, Result};
pub use protocol::{Request, Response};
pub use sink::{DownloadSink, FileSink, MemorySink};
pub use types::{
    FileInfo, GroupStat, Header, Metadata, MetadataFlag, ServerRole, StorageCommand,
    StorageServer, StorageStat, StorageStatus, TrackerCommand,
};
