//! Module lifecycle
//!
//! A module is built from its flags by the registry, then `init` validates
//! everything that can fail and hands back the module's control loop as a
//! future. Nothing runs until the pipeline spawns those futures, so a
//! pipeline that fails to initialize never leaves half-started modules
//! behind.
//!
//! Every control loop ends with the same shutdown sequence:
//!
//! 1. wait for the stream workers it spawned
//! 2. forward `Terminate` downstream (when the loop stopped on one)
//! 3. receive once more from the input, so the upstream neighbour can
//!    finish its own sequence
//! 4. close the output

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{
    announce, ControlReceiver, ControlSender, Message, Metadata, StreamReceiver, StreamSender,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// A module's control loop, ready to be spawned
pub type Worker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Control queues owned by one module
#[derive(Debug)]
pub struct ModuleIo {
    pub input: ControlReceiver,
    pub output: ControlSender,
}

/// A pipeline stage
pub trait Module: Send {
    /// Registry name of the module
    fn name(&self) -> &'static str;

    /// Validate configuration and return the control loop
    ///
    /// Must not block. Errors here abort pipeline initialization.
    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError>;
}

/// Per-stream behaviour of a one-in one-out module
pub trait StreamHandler: Send + Sync + 'static {
    /// Process one stream
    ///
    /// `inbound` must be consumed to the end, and `outbound` dropped once the
    /// handler has nothing more to send.
    fn handle(
        self: Arc<Self>,
        metadata: Metadata,
        inbound: StreamReceiver,
        outbound: StreamSender,
    ) -> impl Future<Output = ()> + Send;
}

/// Control loop shared by transform-style modules
///
/// For every announced stream, a matching stream is announced downstream
/// right away and a worker spawned to run `handler` once both sides have
/// started. Downstream metadata mirrors upstream metadata. In single-stream
/// mode the loop stops after the first stream and emits `Terminate` itself.
pub async fn serve_streams<H: StreamHandler>(
    name: &'static str,
    handler: Arc<H>,
    io: ModuleIo,
    multi_streams: bool,
) {
    let ModuleIo { mut input, output } = io;
    let mut workers = JoinSet::new();

    loop {
        match input.recv().await {
            None => break,
            Some(Message::Terminate) => {
                join_workers(name, &mut workers).await;
                send_control(name, &output, Message::Terminate).await;
                break;
            }
            Some(Message::Announce(upstream)) => {
                let (starter, downstream) = announce();
                send_control(name, &output, Message::Announce(downstream)).await;

                let handler = Arc::clone(&handler);
                workers.spawn(async move {
                    let (metadata, inbound) = upstream.begin().await;
                    let outbound = starter.start(metadata.clone());
                    handler.handle(metadata, inbound, outbound).await;
                });

                if !multi_streams {
                    join_workers(name, &mut workers).await;
                    send_control(name, &output, Message::Terminate).await;
                    break;
                }
            }
        }
    }

    join_workers(name, &mut workers).await;
    finish(name, input, output).await;
}

/// Send a control message, logging instead of failing when nobody listens
pub async fn send_control(name: &'static str, output: &ControlSender, message: Message) {
    if let Err(err) = output.send(message).await {
        debug!(module = name, message = ?err.0, "downstream control queue closed");
    }
}

/// Wait for every spawned stream worker
pub async fn join_workers(name: &'static str, workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            error!(module = name, error = %err, "stream worker failed");
        }
    }
}

/// Final rendezvous with the upstream neighbour, then close the output
pub async fn finish(name: &'static str, mut input: ControlReceiver, output: ControlSender) {
    let _ = input.recv().await;
    drop(output);
    info!(module = name, "module completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{control_queue, stream_queue, Announce};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Reverse;

    impl StreamHandler for Reverse {
        fn handle(
            self: Arc<Self>,
            _metadata: Metadata,
            mut inbound: StreamReceiver,
            outbound: StreamSender,
        ) -> impl Future<Output = ()> + Send {
            async move {
                while let Some(chunk) = inbound.recv().await {
                    let reversed: Vec<u8> = chunk.iter().rev().copied().collect();
                    if outbound.send(Bytes::from(reversed)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn ready(data: &'static [u8], metadata: Metadata) -> Announce {
        let (tx, rx) = stream_queue();
        tokio::spawn(async move {
            let _ = tx.send(Bytes::from_static(data)).await;
        });
        Announce::ready(metadata, rx)
    }

    async fn collect(announced: Announce) -> (Metadata, Vec<u8>) {
        let (metadata, mut rx) = announced.begin().await;
        let mut data = Vec::new();
        while let Some(chunk) = rx.recv().await {
            data.extend_from_slice(&chunk);
        }
        (metadata, data)
    }

    #[tokio::test]
    async fn test_single_stream_synthesizes_terminate() {
        let (in_tx, in_rx) = control_queue();
        let (out_tx, mut out_rx) = control_queue();
        let task = tokio::spawn(serve_streams(
            "reverse",
            Arc::new(Reverse),
            ModuleIo {
                input: in_rx,
                output: out_tx,
            },
            false,
        ));

        in_tx
            .send(Message::Announce(ready(b"abc", Metadata::new().with("id", 1))))
            .await
            .unwrap();

        let Some(Message::Announce(downstream)) = out_rx.recv().await else {
            panic!("expected announce");
        };
        let (metadata, data) = collect(downstream).await;
        assert_eq!(metadata.get_u64("id"), Some(1));
        assert_eq!(data, b"cba");

        assert!(matches!(out_rx.recv().await, Some(Message::Terminate)));

        // A second announce is consumed by the final receive and never served
        in_tx
            .send(Message::Announce(ready(b"ignored", Metadata::new())))
            .await
            .unwrap();
        assert!(out_rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_stream_two_phase_shutdown() {
        let (in_tx, in_rx) = control_queue();
        let (out_tx, mut out_rx) = control_queue();
        let task = tokio::spawn(serve_streams(
            "reverse",
            Arc::new(Reverse),
            ModuleIo {
                input: in_rx,
                output: out_tx,
            },
            true,
        ));

        for payload in [&b"one"[..], b"two"] {
            in_tx
                .send(Message::Announce(ready(payload, Metadata::new())))
                .await
                .unwrap();
            let Some(Message::Announce(downstream)) = out_rx.recv().await else {
                panic!("expected announce");
            };
            let (_, data) = collect(downstream).await;
            let expected: Vec<u8> = payload.iter().rev().copied().collect();
            assert_eq!(data, expected);
        }

        in_tx.send(Message::Terminate).await.unwrap();
        assert!(matches!(out_rx.recv().await, Some(Message::Terminate)));

        // Output stays open until the input is closed
        assert!(timeout(Duration::from_millis(50), out_rx.recv())
            .await
            .is_err());
        drop(in_tx);
        assert!(out_rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_input_closes_output() {
        let (in_tx, in_rx) = control_queue();
        let (out_tx, mut out_rx) = control_queue();
        let task = tokio::spawn(serve_streams(
            "reverse",
            Arc::new(Reverse),
            ModuleIo {
                input: in_rx,
                output: out_tx,
            },
            true,
        ));

        drop(in_tx);
        assert!(out_rx.recv().await.is_none());
        task.await.unwrap();
    }
}
