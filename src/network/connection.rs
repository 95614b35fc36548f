//! Connection handling
//!
//! Frames are read from and written to any byte stream, so the same code
//! serves TCP sockets and in-memory streams alike.

use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{CodecError, Decoder, Encoder, Frame};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed mid-frame")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed byte stream to a remote node
pub struct Connection<S = TcpStream> {
    /// Remote peer label, for logs
    peer: String,
    stream: S,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>, max_frame_size: usize) -> Self {
        Self {
            peer: peer.into(),
            stream,
            encoder: Encoder::with_limit(max_frame_size),
            decoder: Decoder::with_limit(max_frame_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            stats: ConnectionStats::default(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a frame.
    ///
    /// Encoding happens before any byte is written, so a `Protocol` error
    /// leaves the stream untouched.
    pub async fn send(&mut self, frame: &Frame) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(frame, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive a frame (returns None if the peer closed cleanly between frames)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.frames_received += 1;
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Receive a frame with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the write half; the connection carries no further frames
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Request};

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Connection::new(a, "left", 1024);
        let mut right = Connection::new(b, "right", 1024);

        let frame = Request::Ping.to_frame().unwrap();
        left.send(&frame).await.unwrap();
        left.shutdown().await.unwrap();

        let received = right.recv().await.unwrap().unwrap();
        assert_eq!(received.ordinal, Command::Ping.ordinal());
        assert!(right.recv().await.unwrap().is_none());

        assert_eq!(left.stats().frames_sent, 1);
        assert_eq!(right.stats().frames_received, 1);
        assert_eq!(right.stats().bytes_received, left.stats().bytes_sent);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(64);
        let mut conn = Connection::new(b, "peer", 1024);

        // Header promises one parameter that never arrives
        a.write_all(&[0, 0, 0, 1, 0, 0, 0, 1]).await.unwrap();
        drop(a);

        assert!(matches!(conn.recv().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_a, b) = tokio::io::duplex(64);
        let mut conn = Connection::new(b, "peer", 1024);
        let result = conn.recv_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
    }
}
