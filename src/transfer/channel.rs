//! Tagged point-to-point tensor channel.
//!
//! Every message is one frame:
//!
//! ```text
//! [tag: u32 LE][payload_len: u64 LE][payload bytes]
//! ```
//!
//! The receiver always knows the shape and dtype it expects, so frames carry no
//! type information. A frame with a foreign tag or an unexpected length means
//! both sides disagree on the call sequence; the stream cannot be realigned after
//! that and the session must be torn down.
//!
//! Objects are JSON-encoded and sent as two frames: an `int64[1]` byte length
//! followed by a `uint8[len]` payload.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::transfer::tensor::{byte_len, DType, Tensor};
use crate::transfer::topology::{Peer, Topology};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Size of the connection hello (`[tag][rank]`).
const HELLO_LEN: usize = 8;

/// Largest serialized object accepted by `recv_object`.
pub const MAX_OBJECT_BYTES: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("failed to deserialize object: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("failed to serialize object: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ProtocolDesync(_)
                | TransportError::Deserialization(_)
                | TransportError::Io(_)
        )
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame and byte counters.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A turn-based channel to one peer (or one send peer and one recv peer).
pub struct TransportChannel {
    tag: u32,
    reader: BoxedReader,
    writer: BoxedWriter,
    stats: ChannelStats,
}

impl TransportChannel {
    /// Build a channel over arbitrary byte-stream halves.
    pub fn new<R, W>(tag: u32, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            tag,
            reader: Box::new(reader),
            writer: Box::new(writer),
            stats: ChannelStats::default(),
        }
    }

    /// Two connected in-process channels.
    pub fn duplex_pair(tag: u32, max_buf_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::new(tag, a_read, a_write),
            Self::new(tag, b_read, b_write),
        )
    }

    /// Connect to the peers named by `topology`.
    ///
    /// For each peer the lower rank listens and the higher rank connects, then
    /// sends a `[tag][rank]` hello. Inbound connections with a foreign tag or an
    /// unexpected rank are dropped.
    pub async fn establish(topology: &Topology) -> Result<Self, TransportError> {
        let peers = topology.peers();
        let mut pending: Vec<usize> = peers
            .iter()
            .filter(|p| p.rank > topology.rank)
            .map(|p| p.rank)
            .collect();

        let listener = if pending.is_empty() {
            None
        } else {
            let listener = TcpListener::bind(&topology.listen_addr).await?;
            info!(addr = %topology.listen_addr, "Listening for KV peers");
            Some(listener)
        };

        let mut streams: HashMap<usize, TcpStream> = HashMap::new();
        for peer in peers.iter().filter(|p| p.rank < topology.rank) {
            let mut stream = connect_with_retry(peer, topology).await?;
            let mut hello = BytesMut::with_capacity(HELLO_LEN);
            hello.put_u32_le(topology.tag);
            hello.put_u32_le(topology.rank as u32);
            stream.write_all(&hello).await?;
            streams.insert(peer.rank, stream);
        }

        if let Some(listener) = listener {
            while !pending.is_empty() {
                let (mut stream, remote) = listener.accept().await?;
                let mut hello = [0u8; HELLO_LEN];
                if let Err(e) = stream.read_exact(&mut hello).await {
                    warn!(%remote, error = %e, "Dropping connection without hello");
                    continue;
                }
                let mut buf = &hello[..];
                let tag = buf.get_u32_le();
                let rank = buf.get_u32_le() as usize;
                if tag != topology.tag {
                    warn!(%remote, tag, "Dropping connection with foreign tag");
                    continue;
                }
                let Some(pos) = pending.iter().position(|&r| r == rank) else {
                    warn!(%remote, rank, "Dropping connection from unexpected rank");
                    continue;
                };
                pending.swap_remove(pos);
                stream.set_nodelay(true)?;
                streams.insert(rank, stream);
            }
        }

        let missing = |rank| {
            TransportError::Topology(format!("no connection established to rank {rank}"))
        };
        let channel = if topology.is_symmetric() {
            let stream = streams
                .remove(&topology.send_peer.rank)
                .ok_or_else(|| missing(topology.send_peer.rank))?;
            let (reader, writer) = tokio::io::split(stream);
            Self::new(topology.tag, reader, writer)
        } else {
            let send_stream = streams
                .remove(&topology.send_peer.rank)
                .ok_or_else(|| missing(topology.send_peer.rank))?;
            let recv_stream = streams
                .remove(&topology.recv_peer.rank)
                .ok_or_else(|| missing(topology.recv_peer.rank))?;
            let (_, writer) = tokio::io::split(send_stream);
            let (reader, _) = tokio::io::split(recv_stream);
            Self::new(topology.tag, reader, writer)
        };

        info!(
            rank = topology.rank,
            send_peer = topology.send_peer.rank,
            recv_peer = topology.recv_peer.rank,
            tag = topology.tag,
            "KV transport established"
        );
        Ok(channel)
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Send one tensor as a single frame.
    pub async fn send(&mut self, tensor: &Tensor) -> Result<(), TransportError> {
        self.send_frame(tensor.as_bytes()).await
    }

    /// Receive one tensor of exactly `shape` x `dtype`.
    pub async fn recv(&mut self, shape: &[usize], dtype: DType) -> Result<Tensor, TransportError> {
        let expected = byte_len(shape, dtype);
        let payload = self.recv_frame(expected).await?;
        Tensor::from_bytes(shape.to_vec(), dtype, payload)
    }

    /// Serialize `value` and send it behind an `int64[1]` length header.
    pub async fn send_object<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(value).map_err(TransportError::Serialization)?;
        let len = Tensor::from_slice(vec![1], &[payload.len() as i64])?;
        self.send(&len).await?;
        self.send_frame(&payload).await
    }

    /// Receive an object sent with [`send_object`](Self::send_object).
    ///
    /// An empty payload decodes as JSON `null`.
    pub async fn recv_object<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let header = self.recv(&[1], DType::I64).await?;
        let len = header
            .to_vec::<i64>()?
            .first()
            .copied()
            .ok_or_else(|| TransportError::ProtocolDesync("empty object length header".into()))?;
        let len = usize::try_from(len)
            .map_err(|_| TransportError::ProtocolDesync(format!("negative object length {len}")))?;
        if len > MAX_OBJECT_BYTES {
            return Err(TransportError::ProtocolDesync(format!(
                "object length {len} exceeds {MAX_OBJECT_BYTES} bytes"
            )));
        }

        let payload = self.recv_frame(len).await?;
        let bytes: &[u8] = if payload.is_empty() { b"null" } else { &payload };
        serde_json::from_slice(bytes).map_err(TransportError::Deserialization)
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut header = BytesMut::with_capacity(FRAME_HEADER_LEN);
        header.put_u32_le(self.tag);
        header.put_u64_le(payload.len() as u64);

        self.writer.write_all(&header).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += (FRAME_HEADER_LEN + payload.len()) as u64;
        Ok(())
    }

    async fn recv_frame(&mut self, expected_len: usize) -> Result<Bytes, TransportError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.reader.read_exact(&mut header).await?;
        let mut buf = &header[..];
        let tag = buf.get_u32_le();
        let len = buf.get_u64_le();

        if tag != self.tag {
            return Err(TransportError::ProtocolDesync(format!(
                "frame tag {tag} does not match channel tag {}",
                self.tag
            )));
        }
        if len != expected_len as u64 {
            return Err(TransportError::ProtocolDesync(format!(
                "expected a {expected_len}-byte frame, peer sent {len} bytes"
            )));
        }

        let mut payload = BytesMut::zeroed(expected_len);
        self.reader.read_exact(&mut payload).await?;

        self.stats.frames_received += 1;
        self.stats.bytes_received += (FRAME_HEADER_LEN + expected_len) as u64;
        Ok(payload.freeze())
    }
}

async fn connect_with_retry(peer: &Peer, topology: &Topology) -> Result<TcpStream, TransportError> {
    let backoff = Duration::from_millis(topology.connect_backoff_ms);
    let mut attempt = 0;
    loop {
        match TcpStream::connect(&peer.addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(peer = peer.rank, addr = %peer.addr, attempt, "Connected to KV peer");
                return Ok(stream);
            }
            Err(e) if attempt < topology.connect_retries => {
                debug!(peer = peer.rank, addr = %peer.addr, attempt, error = %e, "Peer not reachable yet");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
