//! Protocol encoding and decoding.
//!
//! Everything that touches wire bytes lives here: the 10-byte header, the
//! fixed-width field helpers, the [`Request`] body encoders, and the
//! per-command response decoders. The connection layer moves bytes; this
//! module decides what they mean.

use std::path::Path;
use std::time::{Duration, SystemTime};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::Charset;
use crate::errors::{Error, Result};
use crate::types::*;

/// Encodes a protocol header into its 10-byte wire form.
///
/// Layout: body length (8 bytes, big-endian) | command (1 byte) | status (1 byte).
pub fn encode_header(length: u64, command: u8, status: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN);
    buf.put_u64(length);
    buf.put_u8(command);
    buf.put_u8(status);
    buf.freeze()
}

/// Decodes a protocol header from a buffer of at least 10 bytes.
pub fn decode_header(data: &[u8]) -> Result<Header> {
    if data.len() < FDFS_PROTO_HEADER_LEN {
        return Err(Error::Protocol(format!(
            "header too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = &data[..FDFS_PROTO_HEADER_LEN];
    let length = buf.get_u64();
    let command = buf.get_u8();
    let status = buf.get_u8();

    Ok(Header {
        length,
        command,
        status,
    })
}

/// Encodes a string into a fixed-width field, NUL-padded.
///
/// Longer strings are truncated at the field width.
pub fn pad_field(s: &str, width: usize, charset: Charset) -> Bytes {
    let encoded = charset.encode(s);
    let mut buf = BytesMut::with_capacity(width);
    let copy_len = encoded.len().min(width);
    buf.put_slice(&encoded[..copy_len]);
    buf.resize(width, 0);
    buf.freeze()
}

/// Decodes a fixed-width field, trimming trailing NULs.
pub fn unpad_field(data: &[u8], charset: Charset) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    charset.decode(&data[..end])
}

/// Splits a file id of the form `group/path` into its components.
pub fn split_file_id(file_id: &str) -> Result<(String, String)> {
    let (group, path) = file_id
        .split_once('/')
        .ok_or_else(|| Error::InvalidFileId(file_id.to_string()))?;

    if group.is_empty() || group.len() > FDFS_GROUP_NAME_MAX_LEN || path.is_empty() {
        return Err(Error::InvalidFileId(file_id.to_string()));
    }

    Ok((group.to_string(), path.to_string()))
}

/// Joins a group name and a storage-relative path into a file id.
pub fn join_file_id(group: &str, path: &str) -> String {
    format!("{}/{}", group, path)
}

/// Extracts the file extension without the leading dot, truncated to the
/// protocol maximum of 6 bytes.
pub fn file_ext_name(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    if ext.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
        ext[..FDFS_FILE_EXT_NAME_MAX_LEN].to_string()
    } else {
        ext.to_string()
    }
}

/// Encodes metadata into the wire record format.
///
/// Records are `key 0x02 value` pairs joined by `0x01`. Keys and values are
/// truncated to their protocol caps. Keys are emitted in sorted order so the
/// encoding is deterministic.
pub fn encode_metadata(metadata: &Metadata, charset: Charset) -> Bytes {
    if metadata.is_empty() {
        return Bytes::new();
    }

    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();

    let mut buf = BytesMut::new();
    for (i, key) in keys.iter().enumerate() {
        let key_bytes = charset.encode(key);
        let value_bytes = charset.encode(&metadata[*key]);

        let key_len = key_bytes.len().min(FDFS_MAX_META_NAME_LEN);
        let value_len = value_bytes.len().min(FDFS_MAX_META_VALUE_LEN);

        if i > 0 {
            buf.put_u8(FDFS_RECORD_SEPARATOR);
        }
        buf.put_slice(&key_bytes[..key_len]);
        buf.put_u8(FDFS_FIELD_SEPARATOR);
        buf.put_slice(&value_bytes[..value_len]);
    }

    buf.freeze()
}

/// Decodes wire metadata records into a map.
///
/// Records that are not exactly `key 0x02 value` are skipped.
pub fn decode_metadata(data: &[u8], charset: Charset) -> Metadata {
    let mut metadata = Metadata::new();
    if data.is_empty() {
        return metadata;
    }

    for record in data.split(|&b| b == FDFS_RECORD_SEPARATOR) {
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = record.split(|&b| b == FDFS_FIELD_SEPARATOR).collect();
        if fields.len() != 2 {
            continue;
        }
        metadata.insert(charset.decode(fields[0]), charset.decode(fields[1]));
    }

    metadata
}

/// One FastDFS request: a command kind plus its parameters.
///
/// Each variant knows its command code, which server role it targets, and how
/// to encode its body. Commands that carry file content declare the content
/// length via [`Request::payload_len`]; the bytes themselves are streamed by
/// the connection, never embedded in the body.
#[derive(Debug, Clone)]
pub enum Request {
    /// Ask a tracker for an upload target in any group
    QueryStoreWithoutGroup,
    /// Ask a tracker for an upload target in a named group
    QueryStoreWithGroup {
        /// Group to upload into
        group: String,
    },
    /// Ask a tracker which storage server holds a file
    QueryFetchOne {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
    },
    /// Ask a tracker which storage server owns a file, for mutation
    QueryUpdate {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
    },
    /// List all groups' stats
    ListGroups,
    /// List the storage servers of one group
    ListStorages {
        /// Group name
        group: String,
        /// Restrict the listing to one storage server
        storage_ip: Option<String>,
    },
    /// Upload a file's bytes to a storage server
    Upload {
        /// Store path index from the tracker's reply
        store_path_index: u8,
        /// File extension, at most 6 bytes
        ext: String,
        /// Exact content length; must be known before the header is written
        size: u64,
        /// Upload as an appender file
        appender: bool,
    },
    /// Upload a slave file next to an existing master file
    UploadSlave {
        /// Storage-relative path of the master file
        master_path: String,
        /// Slave filename prefix, at most 16 bytes
        prefix: String,
        /// File extension, at most 6 bytes
        ext: String,
        /// Exact content length
        size: u64,
    },
    /// Append bytes to an appender file
    Append {
        /// Storage-relative path of the appender file
        path: String,
        /// Exact content length
        size: u64,
    },
    /// Overwrite a byte range of an appender file
    Modify {
        /// Storage-relative path of the appender file
        path: String,
        /// Offset the new bytes start at
        offset: u64,
        /// Exact content length
        size: u64,
    },
    /// Truncate an appender file
    Truncate {
        /// Storage-relative path of the appender file
        path: String,
        /// Size to truncate to
        new_size: u64,
    },
    /// Download a file or a byte range of it
    Download {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
        /// Byte offset to start at
        offset: u64,
        /// Bytes to read; 0 means to end of file
        length: u64,
    },
    /// Delete a file
    Delete {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
    },
    /// Set a file's metadata
    SetMetadata {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
        /// Key/value pairs to apply
        metadata: Metadata,
        /// Overwrite or merge
        flag: MetadataFlag,
    },
    /// Get a file's metadata
    GetMetadata {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
    },
    /// Query a file's size, creation time, and checksum
    QueryFileInfo {
        /// Group name
        group: String,
        /// Storage-relative path
        path: String,
    },
}

impl Request {
    /// The wire command code of this request.
    pub fn command(&self) -> u8 {
        match self {
            Request::QueryStoreWithoutGroup => TrackerCommand::QueryStoreWithoutGroup.into(),
            Request::QueryStoreWithGroup { .. } => TrackerCommand::QueryStoreWithGroup.into(),
            Request::QueryFetchOne { .. } => TrackerCommand::QueryFetchOne.into(),
            Request::QueryUpdate { .. } => TrackerCommand::QueryUpdate.into(),
            Request::ListGroups => TrackerCommand::ServerListAllGroups.into(),
            Request::ListStorages { .. } => TrackerCommand::ServerListStorage.into(),
            Request::Upload { appender: false, .. } => StorageCommand::UploadFile.into(),
            Request::Upload { appender: true, .. } => StorageCommand::UploadAppenderFile.into(),
            Request::UploadSlave { .. } => StorageCommand::UploadSlaveFile.into(),
            Request::Append { .. } => StorageCommand::AppendFile.into(),
            Request::Modify { .. } => StorageCommand::ModifyFile.into(),
            Request::Truncate { .. } => StorageCommand::TruncateFile.into(),
            Request::Download { .. } => StorageCommand::DownloadFile.into(),
            Request::Delete { .. } => StorageCommand::DeleteFile.into(),
            Request::SetMetadata { .. } => StorageCommand::SetMetadata.into(),
            Request::GetMetadata { .. } => StorageCommand::GetMetadata.into(),
            Request::QueryFileInfo { .. } => StorageCommand::QueryFileInfo.into(),
        }
    }

    /// Which server role this request is addressed to.
    pub fn role(&self) -> ServerRole {
        match self {
            Request::QueryStoreWithoutGroup
            | Request::QueryStoreWithGroup { .. }
            | Request::QueryFetchOne { .. }
            | Request::QueryUpdate { .. }
            | Request::ListGroups
            | Request::ListStorages { .. } => ServerRole::Tracker,
            _ => ServerRole::Storage,
        }
    }

    /// Length of the streamed payload that follows the body, if any.
    pub fn payload_len(&self) -> u64 {
        match self {
            Request::Upload { size, .. }
            | Request::UploadSlave { size, .. }
            | Request::Append { size, .. }
            | Request::Modify { size, .. } => *size,
            _ => 0,
        }
    }

    /// Encodes the request body. The header length is this body's length
    /// plus [`Request::payload_len`].
    pub fn encode_body(&self, charset: Charset) -> Bytes {
        match self {
            Request::QueryStoreWithoutGroup | Request::ListGroups => Bytes::new(),

            Request::QueryStoreWithGroup { group } => {
                pad_field(group, FDFS_GROUP_NAME_MAX_LEN, charset)
            }

            Request::QueryFetchOne { group, path }
            | Request::QueryUpdate { group, path }
            | Request::Delete { group, path }
            | Request::GetMetadata { group, path }
            | Request::QueryFileInfo { group, path } => {
                let path_bytes = charset.encode(path);
                let mut buf = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + path_bytes.len());
                buf.put(pad_field(group, FDFS_GROUP_NAME_MAX_LEN, charset));
                buf.put(path_bytes);
                buf.freeze()
            }

            Request::ListStorages { group, storage_ip } => {
                let mut buf = BytesMut::new();
                buf.put(pad_field(group, FDFS_GROUP_NAME_MAX_LEN, charset));
                if let Some(ip) = storage_ip {
                    buf.put(charset.encode(ip));
                }
                buf.freeze()
            }

            Request::Upload {
                store_path_index,
                ext,
                size,
                ..
            } => {
                let mut buf =
                    BytesMut::with_capacity(1 + FDFS_PROTO_PKG_LEN_SIZE + FDFS_FILE_EXT_NAME_MAX_LEN);
                buf.put_u8(*store_path_index);
                buf.put_u64(*size);
                buf.put(pad_field(ext, FDFS_FILE_EXT_NAME_MAX_LEN, charset));
                buf.freeze()
            }

            Request::UploadSlave {
                master_path,
                prefix,
                ext,
                size,
            } => {
                let master_bytes = charset.encode(master_path);
                let mut buf = BytesMut::new();
                buf.put_u64(master_bytes.len() as u64);
                buf.put_u64(*size);
                buf.put(pad_field(prefix, FDFS_FILE_PREFIX_MAX_LEN, charset));
                buf.put(pad_field(ext, FDFS_FILE_EXT_NAME_MAX_LEN, charset));
                buf.put(master_bytes);
                buf.freeze()
            }

            Request::Append { path, size } => {
                let path_bytes = charset.encode(path);
                let mut buf = BytesMut::new();
                buf.put_u64(path_bytes.len() as u64);
                buf.put_u64(*size);
                buf.put(path_bytes);
                buf.freeze()
            }

            Request::Modify { path, offset, size } => {
                let path_bytes = charset.encode(path);
                let mut buf = BytesMut::new();
                buf.put_u64(path_bytes.len() as u64);
                buf.put_u64(*offset);
                buf.put_u64(*size);
                buf.put(path_bytes);
                buf.freeze()
            }

            Request::Truncate { path, new_size } => {
                let path_bytes = charset.encode(path);
                let mut buf = BytesMut::new();
                buf.put_u64(path_bytes.len() as u64);
                buf.put_u64(*new_size);
                buf.put(path_bytes);
                buf.freeze()
            }

            Request::Download {
                group,
                path,
                offset,
                length,
            } => {
                let path_bytes = charset.encode(path);
                let mut buf = BytesMut::new();
                buf.put_u64(*offset);
                buf.put_u64(*length);
                buf.put(pad_field(group, FDFS_GROUP_NAME_MAX_LEN, charset));
                buf.put(path_bytes);
                buf.freeze()
            }

            Request::SetMetadata {
                group,
                path,
                metadata,
                flag,
            } => {
                let path_bytes = charset.encode(path);
                let meta_bytes = encode_metadata(metadata, charset);
                let mut buf = BytesMut::new();
                buf.put_u64(path_bytes.len() as u64);
                buf.put_u64(meta_bytes.len() as u64);
                buf.put_u8((*flag).into());
                buf.put(pad_field(group, FDFS_GROUP_NAME_MAX_LEN, charset));
                buf.put(path_bytes);
                buf.put(meta_bytes);
                buf.freeze()
            }
        }
    }
}

/// A buffered response: the parsed header and the fully-loaded body.
///
/// Streamed responses never materialize as this type; their bytes go
/// straight to the caller's sink.
#[derive(Debug)]
pub struct Response {
    /// Parsed response header
    pub header: Header,
    /// Response body, exactly `header.length` bytes
    pub body: Bytes,
}

/// Decodes a query-store reply: the assigned group plus the upload target.
pub fn decode_query_store(body: &[u8], charset: Charset) -> Result<(String, StorageServer)> {
    let expected = FDFS_GROUP_NAME_MAX_LEN + FDFS_IPADDR_WIRE_LEN + FDFS_PROTO_PKG_LEN_SIZE + 1;
    if body.len() < expected {
        return Err(Error::Protocol(format!(
            "query-store reply too short: {} bytes, expected {}",
            body.len(),
            expected
        )));
    }

    let group = unpad_field(&body[..FDFS_GROUP_NAME_MAX_LEN], charset);
    let mut offset = FDFS_GROUP_NAME_MAX_LEN;
    let ip_addr = unpad_field(&body[offset..offset + FDFS_IPADDR_WIRE_LEN], charset);
    offset += FDFS_IPADDR_WIRE_LEN;
    let port = (&body[offset..offset + FDFS_PROTO_PKG_LEN_SIZE]).get_u64() as u16;
    offset += FDFS_PROTO_PKG_LEN_SIZE;
    let store_path_index = body[offset];

    Ok((
        group,
        StorageServer {
            ip_addr,
            port,
            store_path_index,
        },
    ))
}

/// Decodes a query-fetch or query-update reply into the owning storage server.
pub fn decode_fetch_server(body: &[u8], charset: Charset) -> Result<StorageServer> {
    let expected = FDFS_GROUP_NAME_MAX_LEN + FDFS_IPADDR_WIRE_LEN + FDFS_PROTO_PKG_LEN_SIZE;
    if body.len() < expected {
        return Err(Error::Protocol(format!(
            "query-fetch reply too short: {} bytes, expected {}",
            body.len(),
            expected
        )));
    }

    let mut offset = FDFS_GROUP_NAME_MAX_LEN;
    let ip_addr = unpad_field(&body[offset..offset + FDFS_IPADDR_WIRE_LEN], charset);
    offset += FDFS_IPADDR_WIRE_LEN;
    let port = (&body[offset..offset + FDFS_PROTO_PKG_LEN_SIZE]).get_u64() as u16;

    Ok(StorageServer {
        ip_addr,
        port,
        store_path_index: 0,
    })
}

/// Decodes an upload reply into `(group, path)`.
pub fn decode_upload_reply(body: &[u8], charset: Charset) -> Result<(String, String)> {
    if body.len() <= FDFS_GROUP_NAME_MAX_LEN {
        return Err(Error::Protocol(format!(
            "upload reply too short: {} bytes",
            body.len()
        )));
    }

    let group = unpad_field(&body[..FDFS_GROUP_NAME_MAX_LEN], charset);
    let path = charset.decode(&body[FDFS_GROUP_NAME_MAX_LEN..]);
    if group.is_empty() || path.is_empty() {
        return Err(Error::Protocol("upload reply names no file".into()));
    }

    Ok((group, path))
}

/// Decodes a query-file-info reply.
pub fn decode_file_info(body: &[u8], charset: Charset) -> Result<FileInfo> {
    let expected = 3 * FDFS_PROTO_PKG_LEN_SIZE + FDFS_IPADDR_WIRE_LEN;
    if body.len() < expected {
        return Err(Error::Protocol(format!(
            "file-info reply too short: {} bytes, expected {}",
            body.len(),
            expected
        )));
    }

    let mut buf = &body[..3 * FDFS_PROTO_PKG_LEN_SIZE];
    let file_size = buf.get_u64();
    let create_timestamp = buf.get_u64();
    let crc32 = buf.get_u64() as u32;
    let source_ip_addr = unpad_field(
        &body[3 * FDFS_PROTO_PKG_LEN_SIZE..3 * FDFS_PROTO_PKG_LEN_SIZE + FDFS_IPADDR_WIRE_LEN],
        charset,
    );

    Ok(FileInfo {
        file_size,
        create_time: SystemTime::UNIX_EPOCH + Duration::from_secs(create_timestamp),
        crc32,
        source_ip_addr,
    })
}

/// Decodes a list-groups reply into one stat record per group.
pub fn decode_group_stats(body: &[u8], charset: Charset) -> Result<Vec<GroupStat>> {
    if body.len() % FDFS_GROUP_STAT_LEN != 0 {
        return Err(Error::Protocol(format!(
            "list-groups reply length {} is not a multiple of {}",
            body.len(),
            FDFS_GROUP_STAT_LEN
        )));
    }

    let mut groups = Vec::with_capacity(body.len() / FDFS_GROUP_STAT_LEN);
    for record in body.chunks_exact(FDFS_GROUP_STAT_LEN) {
        let group_name = unpad_field(&record[..FDFS_GROUP_NAME_MAX_LEN + 1], charset);
        let mut buf = &record[FDFS_GROUP_NAME_MAX_LEN + 1..];
        groups.push(GroupStat {
            group_name,
            total_mb: buf.get_u64(),
            free_mb: buf.get_u64(),
            trunk_free_mb: buf.get_u64(),
            storage_count: buf.get_u64(),
            storage_port: buf.get_u64(),
            storage_http_port: buf.get_u64(),
            active_count: buf.get_u64(),
            current_write_server: buf.get_u64(),
            store_path_count: buf.get_u64(),
            subdir_count_per_path: buf.get_u64(),
            current_trunk_file_id: buf.get_u64(),
        });
    }

    Ok(groups)
}

/// Decodes a list-storages reply into one stat record per storage server.
pub fn decode_storage_stats(body: &[u8], charset: Charset) -> Result<Vec<StorageStat>> {
    if body.len() % FDFS_STORAGE_STAT_LEN != 0 {
        return Err(Error::Protocol(format!(
            "list-storages reply length {} is not a multiple of {}",
            body.len(),
            FDFS_STORAGE_STAT_LEN
        )));
    }

    let mut storages = Vec::with_capacity(body.len() / FDFS_STORAGE_STAT_LEN);
    for record in body.chunks_exact(FDFS_STORAGE_STAT_LEN) {
        let status = StorageStatus::from(record[0]);
        let mut offset = 1;
        let id = unpad_field(&record[offset..offset + FDFS_STORAGE_ID_MAX_SIZE], charset);
        offset += FDFS_STORAGE_ID_MAX_SIZE;
        let ip_addr = unpad_field(&record[offset..offset + FDFS_IPADDR_WIRE_LEN], charset);
        offset += FDFS_IPADDR_WIRE_LEN;
        let domain_name = unpad_field(&record[offset..offset + FDFS_DOMAIN_NAME_MAX_SIZE], charset);
        offset += FDFS_DOMAIN_NAME_MAX_SIZE;
        let src_ip_addr = unpad_field(&record[offset..offset + FDFS_IPADDR_WIRE_LEN], charset);
        offset += FDFS_IPADDR_WIRE_LEN;
        let version = unpad_field(&record[offset..offset + FDFS_VERSION_SIZE], charset);
        offset += FDFS_VERSION_SIZE;

        let mut buf = &record[offset..offset + 20 * FDFS_PROTO_PKG_LEN_SIZE];
        let stat = StorageStat {
            status,
            id,
            ip_addr,
            domain_name,
            src_ip_addr,
            version,
            join_time: buf.get_u64(),
            up_time: buf.get_u64(),
            total_mb: buf.get_u64(),
            free_mb: buf.get_u64(),
            upload_priority: buf.get_u64(),
            storage_port: buf.get_u64(),
            storage_http_port: buf.get_u64(),
            store_path_count: buf.get_u64(),
            subdir_count_per_path: buf.get_u64(),
            current_write_path: buf.get_u64(),
            total_upload_count: buf.get_u64(),
            success_upload_count: buf.get_u64(),
            total_download_count: buf.get_u64(),
            success_download_count: buf.get_u64(),
            total_delete_count: buf.get_u64(),
            success_delete_count: buf.get_u64(),
            last_source_update: buf.get_u64(),
            last_sync_update: buf.get_u64(),
            last_synced_timestamp: buf.get_u64(),
            last_heart_beat_time: buf.get_u64(),
            if_trunk_server: record[FDFS_STORAGE_STAT_LEN - 1] != 0,
        };
        storages.push(stat);
    }

    Ok(storages)
}
