//! Error definitions for the FastDFS client.
//!
//! All fallible operations return [`Result`]. Errors carry enough context to
//! tell connection-level failures (which discard the connection) apart from
//! server-reported failures (which leave the connection usable).

use thiserror::Error;

/// Result type alias for FastDFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Base error type for all FastDFS client errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected at client construction
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TCP connect failed, was refused, or timed out
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address of the unreachable server
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A read or write deadline was exceeded mid-exchange
    #[error("{operation} to {addr} timed out")]
    Timeout {
        /// Which I/O step timed out ("read" or "write")
        operation: &'static str,
        /// Peer the exchange was talking to
        addr: String,
    },

    /// Network I/O failed mid-exchange
    #[error("network error during {operation} to {addr}: {source}")]
    Network {
        /// Which I/O step failed
        operation: &'static str,
        /// Peer the exchange was talking to
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Malformed frame, length mismatch, or undecodable body
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with a nonzero status byte
    #[error("server error (status {status}): {message}")]
    Server {
        /// Raw status byte from the response header
        status: u8,
        /// Human-readable meaning of the status
        message: &'static str,
    },

    /// All connections in use and none freed within the acquire deadline
    #[error("connection pool for {endpoint} exhausted")]
    PoolExhausted {
        /// Endpoint whose pool timed out
        endpoint: String,
    },

    /// A download sink rejected or lost bytes
    #[error("download sink error: {0}")]
    Stream(String),

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// The client has been closed
    #[error("client is closed")]
    Closed,

    /// File ID is not of the form `group/path`
    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    /// The request cannot be executed generically
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Local I/O error (reading an upload source, writing a download target)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors where falling through to the next tracker makes sense.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }
}

/// Maps a FastDFS response status byte to an error.
///
/// Status `0` is success and maps to `None`. The server reuses errno values,
/// so the common codes get their errno meaning.
pub fn map_status_to_error(status: u8) -> Option<Error> {
    let message = match status {
        0 => return None,
        2 => "no such file or directory",
        13 => "permission denied",
        16 => "server busy",
        17 => "file already exists",
        22 => "invalid argument",
        28 => "no space left on storage",
        _ => "server error",
    };
    Some(Error::Server { status, message })
}
