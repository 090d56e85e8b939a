//! Standard input and output modules
//!
//! `stdin` announces a stream as soon as it starts and fills it from the
//! shared process input. Streams coming back around the ring are consumed
//! and discarded. `stdout` writes every stream it receives and emits empty
//! streams downstream.

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{
    announce, drain, Announce, Message, Metadata, StreamReceiver, StreamSender, StreamStarter,
};
use crate::module::{
    finish, join_workers, send_control, serve_streams, Module, ModuleIo, StreamHandler, Worker,
};
use crate::registry::{ModuleArgs, ModuleRegistry, SharedStdin, StdoutClaim};
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Parser)]
#[command(name = "stdin", no_binary_name = true, about = "Reads from stdin")]
struct StdinArgs {}

#[derive(Debug, Parser)]
#[command(name = "stdout", no_binary_name = true, about = "Writes to stdout")]
struct StdoutArgs {}

pub fn construct_stdin(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    StdinArgs::try_parse_from(args.args)?;
    Ok(Box::new(StdinModule {
        registry: Arc::clone(args.registry),
    }))
}

pub fn construct_stdout(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    StdoutArgs::try_parse_from(args.args)?;
    Ok(Box::new(StdoutModule {
        registry: Arc::clone(args.registry),
    }))
}

/// Source module fed by standard input
pub struct StdinModule {
    registry: Arc<ModuleRegistry>,
}

impl Module for StdinModule {
    fn name(&self) -> &'static str {
        "stdin"
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        let source = self.registry.stdio().claim_stdin()?;
        Ok(Box::pin(run_stdin(source, io, global.multi_streams)))
    }
}

async fn run_stdin(source: Arc<SharedStdin>, io: ModuleIo, multi_streams: bool) {
    let ModuleIo { mut input, output } = io;
    let mut workers = JoinSet::new();
    let exhausted = CancellationToken::new();

    let (starter, announced) = announce();
    send_control("stdin", &output, Message::Announce(announced)).await;
    let mut pending: Option<StreamStarter> = Some(starter);

    loop {
        tokio::select! {
            _ = exhausted.cancelled() => {
                pending.take();
                join_workers("stdin", &mut workers).await;
                send_control("stdin", &output, Message::Terminate).await;
                break;
            }
            message = input.recv() => match message {
                None => break,
                Some(Message::Terminate) => {
                    pending.take();
                    join_workers("stdin", &mut workers).await;
                    send_control("stdin", &output, Message::Terminate).await;
                    break;
                }
                Some(Message::Announce(returned)) => {
                    let starter = match pending.take() {
                        Some(starter) => starter,
                        None => {
                            let (starter, announced) = announce();
                            send_control("stdin", &output, Message::Announce(announced)).await;
                            starter
                        }
                    };
                    workers.spawn(pump_stdin(
                        Arc::clone(&source),
                        starter,
                        returned,
                        exhausted.clone(),
                    ));
                    if !multi_streams {
                        join_workers("stdin", &mut workers).await;
                        send_control("stdin", &output, Message::Terminate).await;
                        break;
                    }
                }
            },
        }
    }

    drop(pending);
    join_workers("stdin", &mut workers).await;
    finish("stdin", input, output).await;
}

async fn pump_stdin(
    source: Arc<SharedStdin>,
    starter: StreamStarter,
    returned: Announce,
    exhausted: CancellationToken,
) {
    let mut outbound = Some(starter.start(Metadata::default()));
    let (_, mut returned) = returned.begin().await;
    let mut returning = true;
    let mut chunks = source.lock().await;

    // End of input terminates the ring, even after both streams closed
    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    if let Some(tx) = &outbound {
                        if tx.send(chunk).await.is_err() {
                            debug!("stdin stream consumer closed");
                            outbound = None;
                        }
                    }
                }
                None => break,
            },
            data = returned.recv(), if returning => {
                if data.is_none() {
                    returning = false;
                }
            }
        }
    }

    exhausted.cancel();
    drop(chunks);
    drop(outbound);
    drain(returned).await;
}

/// Sink module writing to standard output
pub struct StdoutModule {
    registry: Arc<ModuleRegistry>,
}

impl Module for StdoutModule {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        let claim = self.registry.stdio().claim_stdout()?;
        Ok(Box::pin(serve_streams(
            "stdout",
            Arc::new(StdoutWriter { claim }),
            io,
            global.multi_streams,
        )))
    }
}

struct StdoutWriter {
    claim: StdoutClaim,
}

impl StreamHandler for StdoutWriter {
    fn handle(
        self: Arc<Self>,
        _metadata: Metadata,
        mut inbound: StreamReceiver,
        outbound: StreamSender,
    ) -> impl Future<Output = ()> + Send {
        async move {
            {
                let mut writer = self.claim.writer().lock().await;
                while let Some(chunk) = inbound.recv().await {
                    if let Err(err) = writer.write_all(&chunk).await {
                        warn!(error = %err, "error writing to stdout");
                        break;
                    }
                    if let Err(err) = writer.flush().await {
                        warn!(error = %err, "error flushing stdout");
                        break;
                    }
                }
            }
            drop(outbound);
            drain(inbound).await;
        }
    }
}
