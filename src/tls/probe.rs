//! ClientHello probe
//!
//! [`HandshakeProbe`] wraps an accepted socket and records every byte read
//! while the ClientHello is inspected. Once the decision is made the
//! recording is either handed out ([`HandshakeProbe::pivot`]) to be relayed
//! untouched, or replayed ([`HandshakeProbe::rewind`]) into a real TLS
//! acceptor.

use super::error::InterceptError;
use bytes::Bytes;
use rustls::server::Acceptor;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;

/// Upper bound on bytes buffered while looking for a ClientHello
pub const MAX_CLIENT_HELLO_BYTES: usize = 64 * 1024;

const PROBE_READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Buffering,
    Replaying { position: usize },
    Passthrough,
}

/// Socket wrapper that records, replays, or forwards reads
#[derive(Debug)]
pub struct HandshakeProbe<S> {
    inner: S,
    captured: Vec<u8>,
    state: ProbeState,
}

impl<S> HandshakeProbe<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            state: ProbeState::Buffering,
        }
    }

    /// Bytes read so far while buffering
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Stop recording and hand out what was read
    pub fn pivot(&mut self) -> Bytes {
        self.state = ProbeState::Passthrough;
        Bytes::from(std::mem::take(&mut self.captured))
    }

    /// Stop recording and serve the recorded bytes to the next reads
    pub fn rewind(&mut self) {
        self.state = if self.captured.is_empty() {
            ProbeState::Passthrough
        } else {
            ProbeState::Replaying { position: 0 }
        };
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HandshakeProbe<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.state {
            ProbeState::Replaying { position } => {
                let remaining = &this.captured[position..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                let position = position + n;
                if position >= this.captured.len() {
                    this.captured = Vec::new();
                    this.state = ProbeState::Passthrough;
                } else {
                    this.state = ProbeState::Replaying { position };
                }
                Poll::Ready(Ok(()))
            }
            ProbeState::Buffering => {
                let before = buf.filled().len();
                ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
                this.captured.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            ProbeState::Passthrough => Pin::new(&mut this.inner).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HandshakeProbe<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// What the first client bytes turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// A complete TLS ClientHello; server name empty when not sent
    Tls { server_name: String },
    /// Anything else, including a ClientHello larger than the probe bound
    NotTls,
}

impl ClientHello {
    pub fn server_name(&self) -> &str {
        match self {
            Self::Tls { server_name } => server_name,
            Self::NotTls => "",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }
}

/// Read from `probe` until a ClientHello is recognized or ruled out
///
/// Each read waits at most `read_timeout`. A client that closes after
/// sending some bytes yields [`ClientHello::NotTls`] so those bytes can
/// still be relayed.
pub async fn read_client_hello<S>(
    probe: &mut HandshakeProbe<S>,
    read_timeout: Duration,
) -> Result<ClientHello, InterceptError>
where
    S: AsyncRead + Unpin,
{
    let mut acceptor = Acceptor::default();
    let mut buf = vec![0u8; PROBE_READ_SIZE];

    loop {
        if probe.captured().len() >= MAX_CLIENT_HELLO_BYTES {
            return Ok(ClientHello::NotTls);
        }

        let n = timeout(read_timeout, probe.read(&mut buf))
            .await
            .map_err(|_| InterceptError::ReadTimeout)??;
        if n == 0 {
            return if probe.captured().is_empty() {
                Err(InterceptError::ClientClosed)
            } else {
                Ok(ClientHello::NotTls)
            };
        }

        let mut pending = &buf[..n];
        while !pending.is_empty() {
            match acceptor.read_tls(&mut pending) {
                Ok(0) | Err(_) => return Ok(ClientHello::NotTls),
                Ok(_) => {}
            }
        }

        match acceptor.accept() {
            Ok(Some(accepted)) => {
                let server_name = accepted
                    .client_hello()
                    .server_name()
                    .unwrap_or_default()
                    .to_string();
                return Ok(ClientHello::Tls { server_name });
            }
            Ok(None) => continue,
            Err(_) => return Ok(ClientHello::NotTls),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_plain_bytes_are_not_tls() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut probe = HandshakeProbe::new(server);
        let hello = read_client_hello(&mut probe, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(hello, ClientHello::NotTls);
        assert_eq!(hello.server_name(), "");
        assert!(b"GET / HTTP/1.0\r\n\r\n".starts_with(probe.captured()));
        assert!(!probe.captured().is_empty());
    }

    #[tokio::test]
    async fn test_pivot_hands_out_capture_then_passes_through() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"hello").await.unwrap();

        let mut probe = HandshakeProbe::new(server);
        let mut first = [0u8; 5];
        probe.read_exact(&mut first).await.unwrap();

        let captured = probe.pivot();
        assert_eq!(&captured[..], b"hello");

        client.write_all(b" world").await.unwrap();
        let mut rest = [0u8; 6];
        probe.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b" world");
        assert!(probe.captured().is_empty());
    }

    #[tokio::test]
    async fn test_rewind_replays_capture() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"abcdef").await.unwrap();

        let mut probe = HandshakeProbe::new(server);
        let mut head = [0u8; 6];
        probe.read_exact(&mut head).await.unwrap();
        probe.rewind();

        client.write_all(b"gh").await.unwrap();
        drop(client);

        let mut all = Vec::new();
        probe.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut probe = HandshakeProbe::new(server);
        let err = read_client_hello(&mut probe, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptError::ReadTimeout));
    }

    #[tokio::test]
    async fn test_closed_client() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut probe = HandshakeProbe::new(server);
        let err = read_client_hello(&mut probe, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptError::ClientClosed));
    }
}
