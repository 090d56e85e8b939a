//! Discarding sink

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{drain, Metadata, StreamReceiver, StreamSender};
use crate::module::{serve_streams, Module, ModuleIo, StreamHandler, Worker};
use crate::registry::ModuleArgs;
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "null", no_binary_name = true, about = "Discards input")]
struct NullArgs {}

pub fn construct(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    NullArgs::try_parse_from(args.args)?;
    Ok(Box::new(NullModule))
}

/// Reads every stream to the end and emits empty streams
#[derive(Debug)]
pub struct NullModule;

impl Module for NullModule {
    fn name(&self) -> &'static str {
        "null"
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        Ok(Box::pin(serve_streams(
            "null",
            Arc::new(Discard),
            io,
            global.multi_streams,
        )))
    }
}

struct Discard;

impl StreamHandler for Discard {
    fn handle(
        self: Arc<Self>,
        _metadata: Metadata,
        inbound: StreamReceiver,
        outbound: StreamSender,
    ) -> impl Future<Output = ()> + Send {
        async move {
            drop(outbound);
            let discarded = drain(inbound).await;
            debug!(bytes = discarded, "discarded stream");
        }
    }
}
