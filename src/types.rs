//! Protocol constants, command codes, and wire data structures.

use std::time::SystemTime;

/// Default tracker port
pub const TRACKER_DEFAULT_PORT: u16 = 22122;
/// Default storage port
pub const STORAGE_DEFAULT_PORT: u16 = 23000;

/// Protocol header size
pub const FDFS_PROTO_HEADER_LEN: usize = 10;
/// Size of a length field on the wire
pub const FDFS_PROTO_PKG_LEN_SIZE: usize = 8;

/// Maximum group name length
pub const FDFS_GROUP_NAME_MAX_LEN: usize = 16;
/// Maximum file extension length
pub const FDFS_FILE_EXT_NAME_MAX_LEN: usize = 6;
/// Maximum slave-file prefix length
pub const FDFS_FILE_PREFIX_MAX_LEN: usize = 16;
/// Maximum storage id length
pub const FDFS_STORAGE_ID_MAX_SIZE: usize = 16;
/// Maximum domain name length in storage stat records
pub const FDFS_DOMAIN_NAME_MAX_SIZE: usize = 128;
/// Version field length in storage stat records
pub const FDFS_VERSION_SIZE: usize = 6;
/// IP address field size including the trailing NUL
pub const IP_ADDRESS_SIZE: usize = 16;
/// Bytes of an IP address field that actually travel on the wire
pub const FDFS_IPADDR_WIRE_LEN: usize = IP_ADDRESS_SIZE - 1;
/// Maximum metadata key length
pub const FDFS_MAX_META_NAME_LEN: usize = 64;
/// Maximum metadata value length
pub const FDFS_MAX_META_VALUE_LEN: usize = 256;

/// Separator between metadata records
pub const FDFS_RECORD_SEPARATOR: u8 = 0x01;
/// Separator between a metadata key and its value
pub const FDFS_FIELD_SEPARATOR: u8 = 0x02;

/// Command code carried by every response header
pub const FDFS_PROTO_CMD_RESP: u8 = 100;

/// Size of one group stat record in a list-groups response body
pub const FDFS_GROUP_STAT_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + 1 + 11 * FDFS_PROTO_PKG_LEN_SIZE;
/// Size of one storage stat record in a list-storages response body
pub const FDFS_STORAGE_STAT_LEN: usize = 1
    + FDFS_STORAGE_ID_MAX_SIZE
    + FDFS_IPADDR_WIRE_LEN
    + FDFS_DOMAIN_NAME_MAX_SIZE
    + FDFS_IPADDR_WIRE_LEN
    + FDFS_VERSION_SIZE
    + 20 * FDFS_PROTO_PKG_LEN_SIZE
    + 1;

/// Tracker protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerCommand {
    /// List one group's stat
    ServerListOneGroup = 90,
    /// List all groups' stats
    ServerListAllGroups = 91,
    /// List storage servers of a group
    ServerListStorage = 92,
    /// Pick a storage server for upload, any group
    QueryStoreWithoutGroup = 101,
    /// Pick a storage server holding an existing file
    QueryFetchOne = 102,
    /// Pick the storage server that owns an existing file, for mutation
    QueryUpdate = 103,
    /// Pick a storage server for upload within a named group
    QueryStoreWithGroup = 104,
}

impl From<TrackerCommand> for u8 {
    fn from(cmd: TrackerCommand) -> u8 {
        cmd as u8
    }
}

/// Storage protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCommand {
    /// Upload a normal file
    UploadFile = 11,
    /// Delete a file
    DeleteFile = 12,
    /// Set file metadata
    SetMetadata = 13,
    /// Download a file or byte range
    DownloadFile = 14,
    /// Get file metadata
    GetMetadata = 15,
    /// Upload a slave file next to a master file
    UploadSlaveFile = 21,
    /// Query size / create time / crc32 of a file
    QueryFileInfo = 22,
    /// Upload an appender file
    UploadAppenderFile = 23,
    /// Append bytes to an appender file
    AppendFile = 24,
    /// Overwrite a byte range of an appender file
    ModifyFile = 34,
    /// Truncate an appender file
    TruncateFile = 36,
}

impl From<StorageCommand> for u8 {
    fn from(cmd: StorageCommand) -> u8 {
        cmd as u8
    }
}

/// Which server role a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    /// Metadata/dispatch server
    Tracker,
    /// Bulk content server
    Storage,
}

/// Storage server status codes as reported by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageStatus {
    /// Initializing
    Init = 0,
    /// Waiting for sync
    WaitSync = 1,
    /// Syncing
    Syncing = 2,
    /// IP changed
    IpChanged = 3,
    /// Deleted from the cluster
    Deleted = 4,
    /// Offline
    Offline = 5,
    /// Online but not yet serving
    Online = 6,
    /// Active
    Active = 7,
    /// Recovering
    Recovery = 9,
    /// Unknown
    None = 99,
}

impl From<u8> for StorageStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => StorageStatus::Init,
            1 => StorageStatus::WaitSync,
            2 => StorageStatus::Syncing,
            3 => StorageStatus::IpChanged,
            4 => StorageStatus::Deleted,
            5 => StorageStatus::Offline,
            6 => StorageStatus::Online,
            7 => StorageStatus::Active,
            9 => StorageStatus::Recovery,
            _ => StorageStatus::None,
        }
    }
}

/// Metadata operation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataFlag {
    /// Replace all existing metadata
    Overwrite = b'O',
    /// Merge into existing metadata
    Merge = b'M',
}

impl From<MetadataFlag> for u8 {
    fn from(flag: MetadataFlag) -> u8 {
        flag as u8
    }
}

/// FastDFS protocol header (10 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length, excluding the header itself
    pub length: u64,
    /// Command code
    pub command: u8,
    /// Status byte; 0 for success
    pub status: u8,
}

/// A storage server selected by a tracker
#[derive(Debug, Clone)]
pub struct StorageServer {
    /// IP address
    pub ip_addr: String,
    /// Port
    pub port: u16,
    /// Store path index to use on upload
    pub store_path_index: u8,
}

/// Size, creation time, checksum, and origin of a stored file
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// File size in bytes
    pub file_size: u64,
    /// When the file was created
    pub create_time: SystemTime,
    /// CRC32 of the content
    pub crc32: u32,
    /// IP of the storage server the file was first written to
    pub source_ip_addr: String,
}

/// One group's stat record from a list-groups response
#[derive(Debug, Clone)]
pub struct GroupStat {
    /// Group name
    pub group_name: String,
    /// Total disk space in MB
    pub total_mb: u64,
    /// Free disk space in MB
    pub free_mb: u64,
    /// Free trunk space in MB
    pub trunk_free_mb: u64,
    /// Number of storage servers in the group
    pub storage_count: u64,
    /// Storage port shared by the group
    pub storage_port: u64,
    /// Storage HTTP port shared by the group
    pub storage_http_port: u64,
    /// Number of active storage servers
    pub active_count: u64,
    /// Index of the current write server
    pub current_write_server: u64,
    /// Store paths per server
    pub store_path_count: u64,
    /// Subdirectories per store path
    pub subdir_count_per_path: u64,
    /// Current trunk file id
    pub current_trunk_file_id: u64,
}

/// One storage server's stat record from a list-storages response
#[derive(Debug, Clone)]
pub struct StorageStat {
    /// Server status
    pub status: StorageStatus,
    /// Storage id
    pub id: String,
    /// IP address
    pub ip_addr: String,
    /// HTTP domain name, if configured
    pub domain_name: String,
    /// IP of the server this one syncs from
    pub src_ip_addr: String,
    /// Server version
    pub version: String,
    /// Join time (unix seconds)
    pub join_time: u64,
    /// Start time (unix seconds)
    pub up_time: u64,
    /// Total disk space in MB
    pub total_mb: u64,
    /// Free disk space in MB
    pub free_mb: u64,
    /// Upload priority
    pub upload_priority: u64,
    /// Storage port
    pub storage_port: u64,
    /// Storage HTTP port
    pub storage_http_port: u64,
    /// Store path count
    pub store_path_count: u64,
    /// Subdirectories per store path
    pub subdir_count_per_path: u64,
    /// Current write path index
    pub current_write_path: u64,
    /// Total upload count
    pub total_upload_count: u64,
    /// Successful upload count
    pub success_upload_count: u64,
    /// Total download count
    pub total_download_count: u64,
    /// Successful download count
    pub success_download_count: u64,
    /// Total delete count
    pub total_delete_count: u64,
    /// Successful delete count
    pub success_delete_count: u64,
    /// Last source-side update (unix seconds)
    pub last_source_update: u64,
    /// Last sync-side update (unix seconds)
    pub last_sync_update: u64,
    /// Timestamp the server is synced up to
    pub last_synced_timestamp: u64,
    /// Last heartbeat (unix seconds)
    pub last_heart_beat_time: u64,
    /// Whether this server is the trunk server of its group
    pub if_trunk_server: bool,
}

/// Metadata dictionary type
pub type Metadata = std::collections::HashMap<String, String>;
