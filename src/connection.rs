//! One TCP connection to a tracker or storage server.
//!
//! A [`Connection`] performs exactly one exchange at a time; `&mut self` on
//! every exchange method is what serializes callers. Any I/O failure, timeout,
//! or framing anomaly leaves the connection in an indeterminate state, so it
//! is flagged broken and the pool discards it instead of reusing it.

use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{Charset, ClientConfig, Endpoint};
use crate::errors::{map_status_to_error, Error, Result};
use crate::protocol::{decode_header, encode_header, Request, Response};
use crate::sink::DownloadSink;
use crate::types::{Header, FDFS_PROTO_CMD_RESP, FDFS_PROTO_HEADER_LEN};

/// A TCP connection to one FastDFS server.
pub struct Connection {
    stream: TcpStream,
    endpoint: Endpoint,
    addr: String,
    charset: Charset,
    read_timeout: Duration,
    write_timeout: Duration,
    chunk_size: usize,
    last_used: Instant,
    broken: bool,
}

impl Connection {
    /// Establishes a connection with the configured socket options.
    ///
    /// Sets `TCP_NODELAY` per config, enables keepalive, and sizes the kernel
    /// send buffer to the write high-water mark so streamed writes pause when
    /// that much data is buffered.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self> {
        let addr = endpoint.to_string();
        let stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    addr,
                    source: e,
                })
            }
            Err(_) => {
                return Err(Error::Connect {
                    addr,
                    source: io::Error::from(io::ErrorKind::TimedOut),
                })
            }
        };

        stream.set_nodelay(config.tcp_nodelay).map_err(|e| Error::Connect {
            addr: addr.clone(),
            source: e,
        })?;
        let sock = SockRef::from(&stream);
        sock.set_keepalive(true).map_err(|e| Error::Connect {
            addr: addr.clone(),
            source: e,
        })?;
        sock.set_send_buffer_size(config.write_high_water_mark)
            .map_err(|e| Error::Connect {
                addr: addr.clone(),
                source: e,
            })?;

        debug!(peer = %addr, "connected");

        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            addr,
            charset: config.charset,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            chunk_size: config.write_low_water_mark,
            last_used: Instant::now(),
            broken: false,
        })
    }

    /// The endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// When this connection last completed an I/O step.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Whether this connection must be discarded.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether this connection may be handed out again: not broken and not
    /// idle past the given TTL.
    pub fn is_usable(&self, idle_ttl: Duration) -> bool {
        !self.broken && self.last_used.elapsed() <= idle_ttl
    }

    /// Performs one buffered exchange: request out, whole response body in.
    pub async fn exchange(&mut self, request: &Request) -> Result<Response> {
        self.send_request(request).await?;
        let header = self.read_response_header().await?;
        let body = self.read_body(&header).await?;
        trace!(peer = %self.addr, cmd = request.command(), len = header.length, "exchange done");
        Ok(Response { header, body })
    }

    /// Performs one exchange whose request carries a streamed payload.
    ///
    /// The payload is copied from `payload` in bounded chunks; it must
    /// provide exactly [`Request::payload_len`] bytes. Running short breaks
    /// the connection, because the frame length has already been committed.
    pub async fn exchange_with_payload<R>(
        &mut self,
        request: &Request,
        payload: &mut R,
    ) -> Result<Response>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.send_request(request).await?;
        self.copy_payload(payload, request.payload_len()).await?;
        let header = self.read_response_header().await?;
        let body = self.read_body(&header).await?;
        Ok(Response { header, body })
    }

    /// Performs one exchange whose response body is streamed into `sink`.
    ///
    /// Chunks are delivered in arrival order and total exactly the response
    /// header's declared length; the body never materializes in memory.
    /// Returns the number of bytes streamed.
    pub async fn exchange_to_sink<S>(&mut self, request: &Request, sink: &mut S) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        match self.stream_response(request, sink).await {
            Ok(streamed) => Ok(streamed),
            Err(e) => {
                sink.release().await;
                Err(e)
            }
        }
    }

    async fn stream_response<S>(&mut self, request: &Request, sink: &mut S) -> Result<u64>
    where
        S: DownloadSink + ?Sized,
    {
        self.send_request(request).await?;
        let header = self.read_response_header().await?;

        let mut remaining = header.length;
        let mut buf = vec![0u8; self.chunk_size.min(remaining.max(1) as usize).max(1)];
        while remaining > 0 {
            let n = (buf.len() as u64).min(remaining) as usize;
            self.read_exact_timed(&mut buf[..n]).await?;
            remaining -= n as u64;
            if let Err(e) = sink.write(Bytes::copy_from_slice(&buf[..n])).await {
                // mid-frame abort: the rest of the body is still on the wire
                self.broken = true;
                return Err(e);
            }
        }

        if let Err(e) = sink.complete().await {
            self.broken = true;
            return Err(e);
        }
        trace!(peer = %self.addr, len = header.length, "streamed response done");
        Ok(header.length)
    }

    /// Half-closes and drops the transport.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Encodes and writes the header and body as one buffer.
    async fn send_request(&mut self, request: &Request) -> Result<()> {
        let body = request.encode_body(self.charset);
        let total_len = body.len() as u64 + request.payload_len();

        let mut frame = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body.len());
        frame.extend_from_slice(&encode_header(total_len, request.command(), 0));
        frame.extend_from_slice(&body);

        self.write_timed(&frame).await
    }

    /// Streams `len` bytes from `payload` to the socket in bounded chunks.
    async fn copy_payload<R>(&mut self, payload: &mut R, len: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size.min(len.max(1) as usize).max(1)];
        let mut remaining = len;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = match payload.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    self.broken = true;
                    return Err(Error::Io(e));
                }
            };
            if n == 0 {
                self.broken = true;
                return Err(Error::Protocol(format!(
                    "upload stream ended early: {} of {} bytes missing",
                    remaining, len
                )));
            }
            self.write_timed(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Reads and validates a response header.
    ///
    /// A header whose command is not the generic response code breaks the
    /// connection. A nonzero status is a server error and carries no body;
    /// the connection stays usable.
    async fn read_response_header(&mut self) -> Result<Header> {
        let mut buf = [0u8; FDFS_PROTO_HEADER_LEN];
        self.read_exact_timed(&mut buf).await?;
        let header = decode_header(&buf)?;

        if header.command != FDFS_PROTO_CMD_RESP {
            self.broken = true;
            return Err(Error::Protocol(format!(
                "unexpected response command {}",
                header.command
            )));
        }
        if let Some(err) = map_status_to_error(header.status) {
            debug!(peer = %self.addr, status = header.status, "server error");
            return Err(err);
        }

        Ok(header)
    }

    /// Reads a buffered response body of exactly the declared length.
    async fn read_body(&mut self, header: &Header) -> Result<Bytes> {
        if header.length == 0 {
            return Ok(Bytes::new());
        }
        let mut body = vec![0u8; header.length as usize];
        self.read_exact_timed(&mut body).await?;
        Ok(Bytes::from(body))
    }

    async fn write_timed(&mut self, data: &[u8]) -> Result<()> {
        match timeout(self.write_timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                self.broken = true;
                Err(Error::Network {
                    operation: "write",
                    addr: self.addr.clone(),
                    source: e,
                })
            }
            Err(_) => {
                self.broken = true;
                Err(Error::Timeout {
                    operation: "write",
                    addr: self.addr.clone(),
                })
            }
        }
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.read_timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                self.broken = true;
                Err(Error::Network {
                    operation: "read",
                    addr: self.addr.clone(),
                    source: e,
                })
            }
            Err(_) => {
                self.broken = true;
                Err(Error::Timeout {
                    operation: "read",
                    addr: self.addr.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("broken", &self.broken)
            .finish()
    }
}
