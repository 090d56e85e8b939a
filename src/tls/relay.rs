//! Bidirectional relay between a connection and a stream pair

use crate::message::{drain, StreamReceiver, StreamSender};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const RELAY_READ_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connection to pipeline
    pub received: u64,
    /// Pipeline to connection
    pub sent: u64,
}

/// Relay until either direction ends
///
/// Every read from the connection must complete within `read_timeout`,
/// otherwise the connection is considered dead. When one direction stops the
/// connection is shut down, `outbound` is closed, and `inbound` is drained
/// to its end.
pub async fn relay<S>(
    connection: S,
    outbound: StreamSender,
    mut inbound: StreamReceiver,
    read_timeout: Duration,
) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(connection);
    let mut stats = RelayStats::default();

    {
        let to_pipeline = async {
            loop {
                let mut buf = BytesMut::with_capacity(RELAY_READ_SIZE);
                match timeout(read_timeout, reader.read_buf(&mut buf)).await {
                    Err(_) => {
                        debug!(timeout = ?read_timeout, "connection read timed out");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(error = %err, "connection read failed");
                        break;
                    }
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        stats.received += n as u64;
                        if outbound.send(buf.freeze()).await.is_err() {
                            debug!("pipeline stopped reading from connection");
                            break;
                        }
                    }
                }
            }
        };
        let mut sent = 0u64;
        let to_connection = async {
            while let Some(chunk) = inbound.recv().await {
                if let Err(err) = writer.write_all(&chunk).await {
                    debug!(error = %err, "connection write failed");
                    break;
                }
                sent += chunk.len() as u64;
            }
        };
        tokio::select! {
            _ = to_pipeline => {}
            _ = to_connection => {}
        }
        stats.sent = sent;
    }

    drop(outbound);
    let mut connection = reader.unsplit(writer);
    if let Err(err) = connection.shutdown().await {
        debug!(error = %err, "connection shutdown failed");
    }
    drop(connection);
    drain(inbound).await;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::stream_queue;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (out_tx, mut out_rx) = stream_queue();
        let (in_tx, in_rx) = stream_queue();

        let task = tokio::spawn(relay(server, out_tx, in_rx, Duration::from_secs(5)));

        client.write_all(b"ping").await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from_static(b"ping"));

        in_tx.send(Bytes::from_static(b"pong")).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client);
        assert!(out_rx.recv().await.is_none());
        drop(in_tx);

        let stats = task.await.unwrap();
        assert_eq!(stats, RelayStats { received: 4, sent: 4 });
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let (_client, server) = tokio::io::duplex(1024);
        let (out_tx, mut out_rx) = stream_queue();
        let (in_tx, in_rx) = stream_queue();

        let task = tokio::spawn(relay(server, out_tx, in_rx, Duration::from_millis(30)));
        assert!(out_rx.recv().await.is_none());

        drop(in_tx);
        assert_eq!(task.await.unwrap(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_closed_pipeline_closes_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (out_tx, _out_rx) = stream_queue();
        let (in_tx, in_rx) = stream_queue();

        let task = tokio::spawn(relay(server, out_tx, in_rx, Duration::from_secs(5)));
        drop(in_tx);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap();
    }
}
