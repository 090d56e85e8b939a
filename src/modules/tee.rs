//! Tee module
//!
//! Passes every stream through unchanged while copying it into a fresh
//! instance of a nested pipeline. Whatever the nested pipeline emits is
//! discarded.

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{drain, stream_queue, Metadata, StreamReceiver, StreamSender};
use crate::module::{serve_streams, Module, ModuleIo, StreamHandler, Worker};
use crate::pipeline::{drive, Pipeline};
use crate::registry::{ModuleArgs, ModuleRegistry};
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Parser)]
#[command(
    name = "tee",
    no_binary_name = true,
    about = "Copies each stream into a nested pipeline"
)]
struct TeeArgs {
    /// Nested pipeline definition, e.g. "upper -- stdout"
    #[arg(long)]
    pipe: String,
}

pub fn construct(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    let parsed = TeeArgs::try_parse_from(args.args)?;
    Ok(Box::new(TeeModule {
        registry: Arc::clone(args.registry),
        definition: parsed.pipe,
    }))
}

pub struct TeeModule {
    registry: Arc<ModuleRegistry>,
    definition: String,
}

impl Module for TeeModule {
    fn name(&self) -> &'static str {
        "tee"
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        if self.definition.trim().is_empty() {
            return Err(ModuleError::invalid_flag("--pipe", "cannot be empty"));
        }
        // Fail early on unknown modules or bad flags
        Pipeline::parse(&self.registry, &self.definition).map_err(Box::new)?;

        let handler = TeeHandler {
            registry: self.registry,
            definition: self.definition,
        };
        Ok(Box::pin(serve_streams(
            "tee",
            Arc::new(handler),
            io,
            global.multi_streams,
        )))
    }
}

struct TeeHandler {
    registry: Arc<ModuleRegistry>,
    definition: String,
}

impl TeeHandler {
    async fn run_nested(self: Arc<Self>, metadata: Metadata, copies: StreamReceiver) {
        let mut nested = match Pipeline::parse(&self.registry, &self.definition) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                warn!(error = %err, "could not build tee pipeline");
                drain(copies).await;
                return;
            }
        };
        let ends = match nested.init(&GlobalFlags::default()) {
            Ok(ends) => ends,
            Err(err) => {
                warn!(error = %err, "could not initialize tee pipeline");
                drain(copies).await;
                return;
            }
        };
        nested.start();

        let (sink, discarded) = stream_queue();
        let discard = tokio::spawn(drain(discarded));
        drive(ends, metadata, copies, sink).await;
        nested.wait().await;
        if let Ok(bytes) = discard.await {
            debug!(bytes, "tee pipeline finished");
        }
    }
}

impl StreamHandler for TeeHandler {
    fn handle(
        self: Arc<Self>,
        metadata: Metadata,
        mut inbound: StreamReceiver,
        outbound: StreamSender,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let (copy_tx, copy_rx) = stream_queue();
            let nested = tokio::spawn(Arc::clone(&self).run_nested(metadata, copy_rx));

            let mut copy = Some(copy_tx);
            let mut outbound = Some(outbound);
            while let Some(chunk) = inbound.recv().await {
                if let Some(tx) = &copy {
                    if tx.send(chunk.clone()).await.is_err() {
                        debug!("tee pipeline stopped reading");
                        copy = None;
                    }
                }
                if let Some(tx) = &outbound {
                    if tx.send(chunk).await.is_err() {
                        outbound = None;
                    }
                }
                if copy.is_none() && outbound.is_none() {
                    break;
                }
            }

            drop(copy);
            drop(outbound);
            drain(inbound).await;
            if let Err(err) = nested.await {
                warn!(error = %err, "tee pipeline task failed");
            }
        }
    }
}
