//! Control messages and stream negotiation
//!
//! Modules talk to each other over bounded control queues carrying
//! [`Message`]s. A message either announces a new logical stream or asks the
//! receiver to shut down.
//!
//! Announcing a stream is a two-sided handshake. The producer keeps a
//! [`StreamStarter`] and hands the matching [`Announce`] downstream. The
//! consumer calls [`Announce::begin`], which waits until the producer calls
//! [`StreamStarter::start`] with the stream metadata. Both methods consume
//! their receiver, so neither side can negotiate twice. If the producer drops
//! its starter without starting, the consumer sees empty metadata and an
//! already-closed stream.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

/// Capacity of control queues between modules
pub const CONTROL_QUEUE_CAPACITY: usize = 1;

/// Capacity of per-stream data queues
pub const STREAM_QUEUE_CAPACITY: usize = 1;

/// Smallest chunk the adaptive reader asks for
pub const MIN_CHUNK_SIZE: usize = 2 << 10;

/// Largest chunk the adaptive reader asks for
pub const MAX_CHUNK_SIZE: usize = 2 << 23;

pub type ControlSender = mpsc::Sender<Message>;
pub type ControlReceiver = mpsc::Receiver<Message>;
pub type StreamSender = mpsc::Sender<Bytes>;
pub type StreamReceiver = mpsc::Receiver<Bytes>;

/// Create a control queue
pub fn control_queue() -> (ControlSender, ControlReceiver) {
    mpsc::channel(CONTROL_QUEUE_CAPACITY)
}

/// Create a stream data queue
pub fn stream_queue() -> (StreamSender, StreamReceiver) {
    mpsc::channel(STREAM_QUEUE_CAPACITY)
}

/// Message exchanged on control queues
#[derive(Debug)]
pub enum Message {
    /// A new logical stream is available
    Announce(Announce),
    /// Orderly shutdown request
    Terminate,
}

/// Immutable key/value description of a stream
///
/// Cloning is cheap. Producers build metadata once and publish it through
/// [`StreamStarter::start`]; consumers only read it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(Arc<BTreeMap<String, Value>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `key` set to `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.0).insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        write!(f, "{}", Value::Object(map))
    }
}

struct Started {
    metadata: Metadata,
    receiver: StreamReceiver,
}

enum Negotiation {
    Pending(oneshot::Receiver<Started>),
    Ready(Metadata, StreamReceiver),
}

/// Consumer half of a stream announcement
pub struct Announce {
    negotiation: Negotiation,
}

impl Announce {
    /// Announce a stream whose metadata and data are already known
    pub fn ready(metadata: Metadata, receiver: StreamReceiver) -> Self {
        Self {
            negotiation: Negotiation::Ready(metadata, receiver),
        }
    }

    /// Wait for the producer to start the stream
    pub async fn begin(self) -> (Metadata, StreamReceiver) {
        match self.negotiation {
            Negotiation::Ready(metadata, receiver) => (metadata, receiver),
            Negotiation::Pending(started) => match started.await {
                Ok(Started { metadata, receiver }) => (metadata, receiver),
                Err(_) => {
                    let (_, receiver) = stream_queue();
                    (Metadata::default(), receiver)
                }
            },
        }
    }
}

impl fmt::Debug for Announce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.negotiation {
            Negotiation::Pending(_) => "pending",
            Negotiation::Ready(..) => "ready",
        };
        f.debug_struct("Announce").field("state", &state).finish()
    }
}

/// Producer half of a stream announcement
pub struct StreamStarter {
    started: oneshot::Sender<Started>,
}

impl fmt::Debug for StreamStarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStarter")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

impl StreamStarter {
    /// Publish the metadata and obtain the sending end of the stream
    ///
    /// If the consumer already dropped its [`Announce`], the returned sender
    /// fails on the first send.
    pub fn start(self, metadata: Metadata) -> StreamSender {
        let (sender, receiver) = stream_queue();
        let _ = self.started.send(Started { metadata, receiver });
        sender
    }

    /// True once the consumer dropped its half
    pub fn is_abandoned(&self) -> bool {
        self.started.is_closed()
    }
}

/// Create a linked starter and announcement
pub fn announce() -> (StreamStarter, Announce) {
    let (started, pending) = oneshot::channel();
    (
        StreamStarter { started },
        Announce {
            negotiation: Negotiation::Pending(pending),
        },
    )
}

/// Consume a stream until its producer closes it, returning the byte count
pub async fn drain(mut receiver: StreamReceiver) -> u64 {
    let mut total = 0u64;
    while let Some(chunk) = receiver.recv().await {
        total += chunk.len() as u64;
    }
    total
}

/// Copy every chunk from `receiver` to `sender`
///
/// Stops early when the consumer goes away; the rest of the input is then
/// drained so the producer never blocks.
pub async fn forward_stream(mut receiver: StreamReceiver, sender: StreamSender) -> u64 {
    let mut total = 0u64;
    while let Some(chunk) = receiver.recv().await {
        total += chunk.len() as u64;
        if sender.send(chunk).await.is_err() {
            drop(sender);
            return total + drain(receiver).await;
        }
    }
    total
}

/// Read `reader` to EOF, emitting chunks on `sender`
///
/// The read size starts at [`MIN_CHUNK_SIZE`] and doubles whenever a read
/// fills the buffer, up to [`MAX_CHUNK_SIZE`]. Returns `BrokenPipe` if the
/// consumer closed the stream first.
pub async fn read_chunks<R>(reader: &mut R, sender: &StreamSender) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut size = MIN_CHUNK_SIZE;
    let mut total = 0u64;
    loop {
        let mut buf = BytesMut::with_capacity(size);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if n >= size && size < MAX_CHUNK_SIZE {
            size *= 2;
        }
        if sender.send(buf.freeze()).await.is_err() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream consumer closed",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_waits_for_start() {
        let (starter, announced) = announce();
        let consumer = tokio::spawn(async move {
            let (metadata, mut rx) = announced.begin().await;
            let chunk = rx.recv().await;
            (metadata, chunk)
        });

        let tx = starter.start(Metadata::new().with("servername", "example.test"));
        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(tx);

        let (metadata, chunk) = consumer.await.unwrap();
        assert_eq!(metadata.get_str("servername"), Some("example.test"));
        assert_eq!(chunk.unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_debug_shows_negotiation_state() {
        let (starter, announced) = announce();
        assert_eq!(format!("{starter:?}"), "StreamStarter { abandoned: false }");
        assert_eq!(format!("{announced:?}"), r#"Announce { state: "pending" }"#);

        drop(announced);
        assert_eq!(format!("{starter:?}"), "StreamStarter { abandoned: true }");
    }

    #[tokio::test]
    async fn test_abandoned_starter_yields_closed_stream() {
        let (starter, announced) = announce();
        drop(starter);

        let (metadata, mut rx) = announced.begin().await;
        assert!(metadata.is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_after_consumer_dropped() {
        let (starter, announced) = announce();
        drop(announced);
        assert!(starter.is_abandoned());

        let tx = starter.start(Metadata::default());
        assert!(tx.send(Bytes::from_static(b"lost")).await.is_err());
    }

    #[tokio::test]
    async fn test_ready_announce() {
        let (tx, rx) = stream_queue();
        let announced = Announce::ready(Metadata::new().with("decrypt", false), rx);
        drop(tx);

        let (metadata, mut rx) = announced.begin().await;
        assert_eq!(metadata.get_bool("decrypt"), Some(false));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_metadata_copy_on_write() {
        let base = Metadata::new().with("port", 8443);
        let extended = base.clone().with("decrypt", true);

        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get_u64("port"), Some(8443));
        assert_eq!(extended.to_string(), r#"{"decrypt":true,"port":8443}"#);
    }

    #[tokio::test]
    async fn test_read_chunks_preserves_order() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, rx) = mpsc::channel(64);

        let mut reader = &data[..];
        let total = read_chunks(&mut reader, &tx).await.unwrap();
        drop(tx);
        assert_eq!(total, data.len() as u64);

        let mut rx = rx;
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_read_chunks_reports_closed_consumer() {
        let (tx, rx) = stream_queue();
        drop(rx);

        let mut reader = &b"payload"[..];
        let err = read_chunks(&mut reader, &tx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_forward_stream_drains_after_consumer_leaves() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = stream_queue();
        drop(out_rx);

        for chunk in [&b"a"[..], b"bc", b"def"] {
            in_tx.send(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        drop(in_tx);

        assert_eq!(forward_stream(in_rx, out_tx).await, 6);
    }
}
