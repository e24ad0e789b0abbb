//! Client configuration.
//!
//! Everything here is immutable after [`crate::Client`] construction. The
//! builder methods follow the `with_*` convention; validation happens once,
//! when the client is created.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::errors::{Error, Result};

/// A `(host, port)` server address; identity for connection pooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `"host:port"` string.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address `{addr}` is not host:port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("address `{addr}` has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("address `{addr}` has an invalid port")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Text encoding for protocol string fields.
///
/// FastDFS transmits group names, paths, and metadata as raw bytes; the
/// charset decides how Rust strings map onto them. UTF-8 is the default and
/// what current servers use; ISO-8859-1 covers legacy deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8 (default)
    #[default]
    Utf8,
    /// ISO-8859-1 / Latin-1; characters outside the range encode as `?`
    Iso8859_1,
}

impl Charset {
    /// Encodes a string to wire bytes.
    pub fn encode(self, s: &str) -> Bytes {
        match self {
            Charset::Utf8 => Bytes::copy_from_slice(s.as_bytes()),
            Charset::Iso8859_1 => s
                .chars()
                .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                .collect::<Vec<u8>>()
                .into(),
        }
    }

    /// Decodes wire bytes to a string. Invalid UTF-8 is replaced, not rejected.
    pub fn decode(self, data: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Charset::Iso8859_1 => data.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ordered list of tracker endpoints; tried in this order
    pub trackers: Vec<Endpoint>,
    /// Text encoding for protocol string fields
    pub charset: Charset,
    /// Deadline for establishing a TCP connection
    pub connect_timeout: Duration,
    /// Deadline for each read step of an exchange
    pub read_timeout: Duration,
    /// Deadline for each write step of an exchange
    pub write_timeout: Duration,
    /// How long an acquire may wait when the pool is at capacity
    pub acquire_timeout: Duration,
    /// Maximum idle connections kept per endpoint
    pub max_idle_per_pool: usize,
    /// Maximum live connections (idle + in use) per endpoint
    pub max_total_per_pool: usize,
    /// Idle connections older than this are evicted
    pub idle_timeout: Duration,
    /// Whether connect failures are retried
    pub enable_reconnect: bool,
    /// Maximum connect retries when reconnect is enabled
    pub max_reconnect: u32,
    /// Delay between connect retries
    pub reconnect_interval: Duration,
    /// Whether `TCP_NODELAY` is set on new connections
    pub tcp_nodelay: bool,
    /// Kernel send-buffer size; bounds how much streamed payload can sit
    /// unflushed before the writer suspends
    pub write_high_water_mark: usize,
    /// Chunk size for streamed payload and sink copies
    pub write_low_water_mark: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            charset: Charset::Utf8,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            max_idle_per_pool: 8,
            max_total_per_pool: 16,
            idle_timeout: Duration::from_secs(60),
            enable_reconnect: false,
            max_reconnect: 2,
            reconnect_interval: Duration::from_millis(500),
            tcp_nodelay: true,
            write_high_water_mark: 256 * 1024,
            write_low_water_mark: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with the given tracker endpoints.
    pub fn new(trackers: Vec<Endpoint>) -> Self {
        Self {
            trackers,
            ..Default::default()
        }
    }

    /// Creates a configuration from `"host:port"` tracker addresses.
    pub fn from_tracker_addrs<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trackers = addrs
            .into_iter()
            .map(|a| Endpoint::parse(a.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(trackers))
    }

    /// Sets the text encoding for string fields.
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Sets the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the per-write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the pool acquire deadline.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets pool sizing: idle cap and total cap per endpoint.
    pub fn with_pool_size(mut self, max_idle: usize, max_total: usize) -> Self {
        self.max_idle_per_pool = max_idle;
        self.max_total_per_pool = max_total;
        self
    }

    /// Sets the idle-eviction threshold.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enables connect retries with the given attempt cap and backoff.
    pub fn with_reconnect(mut self, max_reconnect: u32, interval: Duration) -> Self {
        self.enable_reconnect = true;
        self.max_reconnect = max_reconnect;
        self.reconnect_interval = interval;
        self
    }

    /// Sets `TCP_NODELAY` on or off.
    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Sets the write watermarks: send-buffer bound and copy chunk size.
    pub fn with_write_watermarks(mut self, high: usize, low: usize) -> Self {
        self.write_high_water_mark = high;
        self.write_low_water_mark = low;
        self
    }

    /// Validates the configuration. Called by `Client::new`.
    pub fn validate(&self) -> Result<()> {
        if self.trackers.is_empty() {
            return Err(Error::Config("tracker list is empty".into()));
        }
        for tracker in &self.trackers {
            if tracker.host.is_empty() {
                return Err(Error::Config("tracker host is empty".into()));
            }
            if tracker.port == 0 {
                return Err(Error::Config(format!("tracker {} has port 0", tracker.host)));
            }
        }
        if self.max_total_per_pool == 0 {
            return Err(Error::Config("max_total_per_pool must be at least 1".into()));
        }
        if self.max_idle_per_pool > self.max_total_per_pool {
            return Err(Error::Config(
                "max_idle_per_pool exceeds max_total_per_pool".into(),
            ));
        }
        if self.write_low_water_mark == 0 {
            return Err(Error::Config("write_low_water_mark must be nonzero".into()));
        }
        if self.write_low_water_mark > self.write_high_water_mark {
            return Err(Error::Config(
                "write_low_water_mark exceeds write_high_water_mark".into(),
            ));
        }
        Ok(())
    }
}
