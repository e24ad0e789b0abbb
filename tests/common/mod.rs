//! In-process mock FastDFS cluster.
//!
//! A tracker listener and a storage listener speaking the real wire frames,
//! enough to run the client end to end without a cluster. The tracker always
//! assigns `group1` and points at the mock storage; the storage keeps files
//! in a shared map the tests can inspect.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fastdfs_client::types::*;
use fastdfs_client::Endpoint;

/// One stored file.
#[derive(Debug, Clone, Default)]
pub struct StoredFile {
    pub data: Vec<u8>,
    pub meta: HashMap<String, String>,
    pub create_time: u64,
}

pub type Files = Arc<Mutex<HashMap<String, StoredFile>>>;

struct StorageCtx {
    files: Files,
    download_delay: Duration,
    seq: AtomicU64,
}

/// A mock tracker + storage pair.
pub struct MockCluster {
    pub tracker: Endpoint,
    pub storage: Endpoint,
    pub files: Files,
}

impl MockCluster {
    pub async fn start() -> Self {
        Self::start_with_delay(Duration::ZERO).await
    }

    /// Starts the cluster; `download_delay` stalls each download response,
    /// which lets tests hold storage connections busy.
    pub async fn start_with_delay(download_delay: Duration) -> Self {
        let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker = Endpoint::new("127.0.0.1", tracker_listener.local_addr().unwrap().port());
        let storage = Endpoint::new("127.0.0.1", storage_listener.local_addr().unwrap().port());

        let files: Files = Arc::new(Mutex::new(HashMap::new()));

        let storage_ctx = Arc::new(StorageCtx {
            files: files.clone(),
            download_delay,
            seq: AtomicU64::new(1),
        });

        let storage_for_tracker = storage.clone();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = tracker_listener.accept().await else {
                    return;
                };
                let storage = storage_for_tracker.clone();
                tokio::spawn(async move {
                    let _ = serve_tracker(sock, storage).await;
                });
            }
        });

        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = storage_listener.accept().await else {
                    return;
                };
                let ctx = storage_ctx.clone();
                tokio::spawn(async move {
                    let _ = serve_storage(sock, ctx).await;
                });
            }
        });

        Self {
            tracker,
            storage,
            files,
        }
    }

    pub fn tracker_addr(&self) -> String {
        self.tracker.to_string()
    }

    pub fn stored(&self, file_id: &str) -> Option<StoredFile> {
        self.files.lock().unwrap().get(file_id).cloned()
    }
}

/// A server that accepts connections and reads forever without answering.
/// Useful for read-timeout tests.
pub async fn silent_server() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    endpoint
}

fn pad(s: &str, width: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.truncate(width);
    out.resize(width, 0);
    out
}

fn unpad(data: &[u8]) -> String {
    let end = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn be64(data: &[u8]) -> u64 {
    u64::from_be_bytes(data[..8].try_into().unwrap())
}

async fn read_frame(sock: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; FDFS_PROTO_HEADER_LEN];
    if sock.read_exact(&mut header).await.is_err() {
        return Ok(None); // peer went away between exchanges
    }
    let len = be64(&header[..8]) as usize;
    let cmd = header[8];
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).await?;
    Ok(Some((cmd, body)))
}

async fn write_reply(sock: &mut TcpStream, status: u8, body: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(FDFS_PROTO_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.push(FDFS_PROTO_CMD_RESP);
    frame.push(status);
    frame.extend_from_slice(body);
    sock.write_all(&frame).await
}

async fn serve_tracker(mut sock: TcpStream, storage: Endpoint) -> std::io::Result<()> {
    while let Some((cmd, body)) = read_frame(&mut sock).await? {
        let (status, reply) = tracker_reply(cmd, &body, &storage);
        write_reply(&mut sock, status, &reply).await?;
    }
    Ok(())
}

fn tracker_reply(cmd: u8, body: &[u8], storage: &Endpoint) -> (u8, Vec<u8>) {
    match cmd {
        // query-store, with or without group
        101 | 104 => {
            let group = if cmd == 104 {
                unpad(&body[..FDFS_GROUP_NAME_MAX_LEN])
            } else {
                "group1".to_string()
            };
            let mut reply = pad(&group, FDFS_GROUP_NAME_MAX_LEN);
            reply.extend_from_slice(&pad(&storage.host, FDFS_IPADDR_WIRE_LEN));
            reply.extend_from_slice(&(storage.port as u64).to_be_bytes());
            reply.push(0); // store path index
            (0, reply)
        }
        // query-fetch / query-update
        102 | 103 => {
            let group = unpad(&body[..FDFS_GROUP_NAME_MAX_LEN]);
            let mut reply = pad(&group, FDFS_GROUP_NAME_MAX_LEN);
            reply.extend_from_slice(&pad(&storage.host, FDFS_IPADDR_WIRE_LEN));
            reply.extend_from_slice(&(storage.port as u64).to_be_bytes());
            (0, reply)
        }
        // list-groups: one record for group1
        91 => {
            let mut reply = pad("group1", FDFS_GROUP_NAME_MAX_LEN + 1);
            let values: [u64; 11] = [10240, 8192, 0, 1, storage.port as u64, 8888, 1, 0, 1, 256, 0];
            for v in values {
                reply.extend_from_slice(&v.to_be_bytes());
            }
            (0, reply)
        }
        // list-storages: one record
        92 => {
            let mut reply = vec![7u8]; // active
            reply.extend_from_slice(&pad("storage-01", FDFS_STORAGE_ID_MAX_SIZE));
            reply.extend_from_slice(&pad(&storage.host, FDFS_IPADDR_WIRE_LEN));
            reply.extend_from_slice(&pad("", FDFS_DOMAIN_NAME_MAX_SIZE));
            reply.extend_from_slice(&pad("", FDFS_IPADDR_WIRE_LEN));
            reply.extend_from_slice(&pad("6.12", FDFS_VERSION_SIZE));
            for i in 0..20u64 {
                reply.extend_from_slice(&i.to_be_bytes());
            }
            reply.push(0);
            assert_eq!(reply.len(), FDFS_STORAGE_STAT_LEN);
            (0, reply)
        }
        _ => (22, Vec::new()),
    }
}

async fn serve_storage(mut sock: TcpStream, ctx: Arc<StorageCtx>) -> std::io::Result<()> {
    while let Some((cmd, body)) = read_frame(&mut sock).await? {
        if cmd == 14 && !ctx.download_delay.is_zero() {
            tokio::time::sleep(ctx.download_delay).await;
        }
        let (status, reply) = storage_reply(cmd, &body, &ctx);
        write_reply(&mut sock, status, &reply).await?;
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn storage_reply(cmd: u8, body: &[u8], ctx: &StorageCtx) -> (u8, Vec<u8>) {
    match cmd {
        // upload / upload-appender
        11 | 23 => {
            let size = be64(&body[1..9]);
            let ext = unpad(&body[9..9 + FDFS_FILE_EXT_NAME_MAX_LEN]);
            let data = &body[9 + FDFS_FILE_EXT_NAME_MAX_LEN..];
            if data.len() as u64 != size {
                return (22, Vec::new());
            }

            let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
            let path = if ext.is_empty() {
                format!("M00/00/00/{seq:06}")
            } else {
                format!("M00/00/00/{seq:06}.{ext}")
            };
            ctx.files.lock().unwrap().insert(
                format!("group1/{path}"),
                StoredFile {
                    data: data.to_vec(),
                    meta: HashMap::new(),
                    create_time: now_secs(),
                },
            );

            let mut reply = pad("group1", FDFS_GROUP_NAME_MAX_LEN);
            reply.extend_from_slice(path.as_bytes());
            (0, reply)
        }
        // upload-slave
        21 => {
            let master_len = be64(&body[..8]) as usize;
            let size = be64(&body[8..16]) as usize;
            let mut offset = 16;
            let prefix = unpad(&body[offset..offset + FDFS_FILE_PREFIX_MAX_LEN]);
            offset += FDFS_FILE_PREFIX_MAX_LEN;
            let ext = unpad(&body[offset..offset + FDFS_FILE_EXT_NAME_MAX_LEN]);
            offset += FDFS_FILE_EXT_NAME_MAX_LEN;
            let master = String::from_utf8_lossy(&body[offset..offset + master_len]).into_owned();
            let data = &body[offset + master_len..];
            if data.len() != size {
                return (22, Vec::new());
            }
            if !ctx.files.lock().unwrap().contains_key(&format!("group1/{master}")) {
                return (2, Vec::new());
            }

            let stem = master.rsplit_once('.').map(|(s, _)| s).unwrap_or(&master);
            let path = if ext.is_empty() {
                format!("{stem}{prefix}")
            } else {
                format!("{stem}{prefix}.{ext}")
            };
            ctx.files.lock().unwrap().insert(
                format!("group1/{path}"),
                StoredFile {
                    data: data.to_vec(),
                    meta: HashMap::new(),
                    create_time: now_secs(),
                },
            );

            let mut reply = pad("group1", FDFS_GROUP_NAME_MAX_LEN);
            reply.extend_from_slice(path.as_bytes());
            (0, reply)
        }
        // download
        14 => {
            let offset = be64(&body[..8]) as usize;
            let length = be64(&body[8..16]) as usize;
            let group = unpad(&body[16..16 + FDFS_GROUP_NAME_MAX_LEN]);
            let path = String::from_utf8_lossy(&body[16 + FDFS_GROUP_NAME_MAX_LEN..]).into_owned();

            let files = ctx.files.lock().unwrap();
            let Some(file) = files.get(&format!("{group}/{path}")) else {
                return (2, Vec::new());
            };
            if offset > file.data.len() {
                return (22, Vec::new());
            }
            let end = if length == 0 {
                file.data.len()
            } else {
                file.data.len().min(offset + length)
            };
            (0, file.data[offset..end].to_vec())
        }
        // delete
        12 => {
            let group = unpad(&body[..FDFS_GROUP_NAME_MAX_LEN]);
            let path = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).into_owned();
            match ctx.files.lock().unwrap().remove(&format!("{group}/{path}")) {
                Some(_) => (0, Vec::new()),
                None => (2, Vec::new()),
            }
        }
        // set-metadata
        13 => {
            let path_len = be64(&body[..8]) as usize;
            let meta_len = be64(&body[8..16]) as usize;
            let flag = body[16];
            let group = unpad(&body[17..17 + FDFS_GROUP_NAME_MAX_LEN]);
            let mut offset = 17 + FDFS_GROUP_NAME_MAX_LEN;
            let path = String::from_utf8_lossy(&body[offset..offset + path_len]).into_owned();
            offset += path_len;
            let meta = parse_meta(&body[offset..offset + meta_len]);

            let mut files = ctx.files.lock().unwrap();
            let Some(file) = files.get_mut(&format!("{group}/{path}")) else {
                return (2, Vec::new());
            };
            if flag == b'O' {
                file.meta = meta;
            } else {
                file.meta.extend(meta);
            }
            (0, Vec::new())
        }
        // get-metadata
        15 => {
            let group = unpad(&body[..FDFS_GROUP_NAME_MAX_LEN]);
            let path = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).into_owned();
            let files = ctx.files.lock().unwrap();
            let Some(file) = files.get(&format!("{group}/{path}")) else {
                return (2, Vec::new());
            };
            (0, render_meta(&file.meta))
        }
        // query-file-info
        22 => {
            let group = unpad(&body[..FDFS_GROUP_NAME_MAX_LEN]);
            let path = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).into_owned();
            let files = ctx.files.lock().unwrap();
            let Some(file) = files.get(&format!("{group}/{path}")) else {
                return (2, Vec::new());
            };
            let mut reply = Vec::new();
            reply.extend_from_slice(&(file.data.len() as u64).to_be_bytes());
            reply.extend_from_slice(&file.create_time.to_be_bytes());
            reply.extend_from_slice(&(checksum(&file.data) as u64).to_be_bytes());
            reply.extend_from_slice(&pad("127.0.0.1", FDFS_IPADDR_WIRE_LEN));
            (0, reply)
        }
        // append
        24 => {
            let path_len = be64(&body[..8]) as usize;
            let size = be64(&body[8..16]) as usize;
            let path = String::from_utf8_lossy(&body[16..16 + path_len]).into_owned();
            let data = &body[16 + path_len..];
            if data.len() != size {
                return (22, Vec::new());
            }
            let mut files = ctx.files.lock().unwrap();
            let Some(file) = files.get_mut(&format!("group1/{path}")) else {
                return (2, Vec::new());
            };
            file.data.extend_from_slice(data);
            (0, Vec::new())
        }
        // modify
        34 => {
            let path_len = be64(&body[..8]) as usize;
            let offset = be64(&body[8..16]) as usize;
            let size = be64(&body[16..24]) as usize;
            let path = String::from_utf8_lossy(&body[24..24 + path_len]).into_owned();
            let data = &body[24 + path_len..];
            if data.len() != size {
                return (22, Vec::new());
            }
            let mut files = ctx.files.lock().unwrap();
            let Some(file) = files.get_mut(&format!("group1/{path}")) else {
                return (2, Vec::new());
            };
            if file.data.len() < offset + size {
                file.data.resize(offset + size, 0);
            }
            file.data[offset..offset + size].copy_from_slice(data);
            (0, Vec::new())
        }
        // truncate
        36 => {
            let path_len = be64(&body[..8]) as usize;
            let new_size = be64(&body[8..16]) as usize;
            let path = String::from_utf8_lossy(&body[16..16 + path_len]).into_owned();
            let mut files = ctx.files.lock().unwrap();
            let Some(file) = files.get_mut(&format!("group1/{path}")) else {
                return (2, Vec::new());
            };
            file.data.resize(new_size, 0);
            (0, Vec::new())
        }
        _ => (22, Vec::new()),
    }
}

fn parse_meta(data: &[u8]) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    for record in data.split(|&b| b == FDFS_RECORD_SEPARATOR) {
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = record.split(|&b| b == FDFS_FIELD_SEPARATOR).collect();
        if fields.len() == 2 {
            meta.insert(
                String::from_utf8_lossy(fields[0]).into_owned(),
                String::from_utf8_lossy(fields[1]).into_owned(),
            );
        }
    }
    meta
}

fn render_meta(meta: &HashMap<String, String>) -> Vec<u8> {
    let mut keys: Vec<&String> = meta.keys().collect();
    keys.sort();
    let mut out = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(FDFS_RECORD_SEPARATOR);
        }
        out.extend_from_slice(key.as_bytes());
        out.push(FDFS_FIELD_SEPARATOR);
        out.extend_from_slice(meta[*key].as_bytes());
    }
    out
}

fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32))
}
