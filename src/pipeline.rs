//! Pipeline assembly and execution
//!
//! A pipeline is an ordered list of modules. `init` gives each module its own
//! control queues and links neighbours with relay tasks that forward
//! messages from one module's output to the next module's input. The first
//! input and the last output are handed back to the caller as
//! [`PipelineEnds`]: the command line closes them into a ring with
//! [`Pipeline::run`], while nested pipelines feed them with [`drive`].

use crate::config::{split_modules, GlobalFlags, ModuleSpec};
use crate::error::{PipelineError, Result};
use crate::message::{
    announce, control_queue, drain, forward_stream, stream_queue, ControlReceiver,
    ControlSender, Message, Metadata, StreamReceiver, StreamSender,
};
use crate::module::{Module, ModuleIo, Worker};
use crate::registry::ModuleRegistry;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

type Task = Pin<Box<dyn Future<Output = Option<&'static str>> + Send + 'static>>;

/// Queue ends of an initialized pipeline
#[derive(Debug)]
pub struct PipelineEnds {
    /// Feeds the first module
    pub input: ControlSender,
    /// Receives from the last module
    pub output: ControlReceiver,
}

/// An ordered list of modules
#[derive(Default)]
pub struct Pipeline {
    modules: Vec<Box<dyn Module>>,
    pending: Vec<Task>,
    running: JoinSet<Option<&'static str>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module
    pub fn add(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Names of the modules not yet initialized, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Build a pipeline from module segments
    pub fn from_specs(registry: &Arc<ModuleRegistry>, specs: &[ModuleSpec]) -> Result<Self> {
        let mut pipeline = Self::new();
        for spec in specs {
            pipeline.add(registry.create(&spec.name, &spec.args)?);
        }
        Ok(pipeline)
    }

    /// Build a pipeline from a textual definition
    ///
    /// Words are split shell-style; `--` separates modules:
    /// `upper -- tee --pipe "lower -- null"`.
    pub fn parse(registry: &Arc<ModuleRegistry>, definition: &str) -> Result<Self> {
        let words = shlex::split(definition)
            .ok_or_else(|| PipelineError::definition(format!("unbalanced quotes in {definition:?}")))?;
        let specs = split_modules(&words);
        if specs.is_empty() {
            return Err(PipelineError::Empty);
        }
        Self::from_specs(registry, &specs)
    }

    /// Initialize every module and wire the relays
    ///
    /// No task runs until [`Pipeline::start`]. On error the modules
    /// initialized so far are dropped without ever running.
    pub fn init(&mut self, global: &GlobalFlags) -> Result<PipelineEnds> {
        if self.modules.is_empty() {
            return Err(PipelineError::Empty);
        }

        let (input, mut next_input) = control_queue();
        let count = self.modules.len();
        let mut pending: Vec<Task> = Vec::with_capacity(count * 2);
        let mut output = None;

        for (index, module) in self.modules.drain(..).enumerate() {
            let name = module.name();
            let (module_output, module_output_rx) = control_queue();
            let io = ModuleIo {
                input: next_input,
                output: module_output,
            };
            let worker = module
                .init(io, global)
                .map_err(|source| PipelineError::init(index + 1, name, source))?;
            pending.push(module_task(name, worker));
            debug!(module = name, position = index + 1, "module initialized");

            if index + 1 == count {
                output = Some(module_output_rx);
                break;
            }
            let (relay_input, relay_input_rx) = control_queue();
            pending.push(Box::pin(async move {
                relay(module_output_rx, relay_input).await;
                None
            }));
            next_input = relay_input_rx;
        }

        let output = output.ok_or(PipelineError::Empty)?;
        self.pending = pending;
        Ok(PipelineEnds { input, output })
    }

    /// Spawn every module control loop and relay
    pub fn start(&mut self) {
        for task in self.pending.drain(..) {
            self.running.spawn(task);
        }
    }

    /// Wait for every task; returns module names in completion order
    pub async fn wait(&mut self) -> Vec<&'static str> {
        let mut completed = Vec::new();
        while let Some(result) = self.running.join_next().await {
            match result {
                Ok(Some(name)) => completed.push(name),
                Ok(None) => {}
                Err(err) => error!(error = %err, "pipeline task failed"),
            }
        }
        completed
    }

    /// Close the pipeline into a ring and run it to completion
    ///
    /// The last module's output is relayed back into the first module's
    /// input, so a source module receives what the sink produced.
    pub async fn run(mut self, global: &GlobalFlags) -> Result<Vec<&'static str>> {
        let names = self.names();
        let PipelineEnds { input, output } = self.init(global)?;
        self.pending.push(Box::pin(async move {
            relay(output, input).await;
            None
        }));
        info!(modules = ?names, "pipeline started");
        self.start();
        let completed = self.wait().await;
        info!(modules = completed.len(), "pipeline finished");
        Ok(completed)
    }
}

fn module_task(name: &'static str, worker: Worker) -> Task {
    Box::pin(async move {
        worker.await;
        Some(name)
    })
}

/// Forward control messages between two queues
///
/// After relaying `Terminate`, waits for the source to close before closing
/// the destination, which preserves the two-phase shutdown across the hop.
pub async fn relay(mut from: ControlReceiver, to: ControlSender) {
    while let Some(message) = from.recv().await {
        let terminate = matches!(message, Message::Terminate);
        if let Err(err) = to.send(message).await {
            debug!(message = ?err.0, "relay destination closed");
            break;
        }
        if terminate {
            let _ = from.recv().await;
            break;
        }
    }
}

/// Push one stream through an initialized pipeline
///
/// Announces `input` with `metadata` to the first module, copies the first
/// stream coming out of the last module into `output`, then shuts the
/// pipeline down. Extra streams emitted by the pipeline are drained.
pub async fn drive(
    ends: PipelineEnds,
    metadata: Metadata,
    input: StreamReceiver,
    output: StreamSender,
) {
    let PipelineEnds {
        input: feed,
        output: mut results,
    } = ends;

    let (starter, announced) = announce();
    if feed.send(Message::Announce(announced)).await.is_err() {
        debug!("pipeline input closed before the stream was announced");
        drain(input).await;
        return;
    }
    let mut starter = Some(starter);
    let mut output = Some(output);
    let mut pumps = JoinSet::new();

    loop {
        match results.recv().await {
            Some(Message::Announce(returned)) => {
                let Some(sink) = output.take() else {
                    pumps.spawn(async move {
                        let (_, rx) = returned.begin().await;
                        drain(rx).await;
                    });
                    continue;
                };
                if let Some(starter) = starter.take() {
                    let tx = starter.start(metadata.clone());
                    pumps.spawn(async move {
                        forward_stream(input, tx).await;
                    });
                }
                pumps.spawn(async move {
                    let (_, rx) = returned.begin().await;
                    forward_stream(rx, sink).await;
                });
                while pumps.join_next().await.is_some() {}
                let _ = feed.send(Message::Terminate).await;
                break;
            }
            Some(Message::Terminate) => {
                let _ = feed.send(Message::Terminate).await;
                break;
            }
            None => break,
        }
    }

    // The pipeline may still emit its own terminate; wait for it, then close
    loop {
        match results.recv().await {
            Some(Message::Announce(returned)) => {
                pumps.spawn(async move {
                    let (_, rx) = returned.begin().await;
                    drain(rx).await;
                });
            }
            Some(Message::Terminate) | None => break,
        }
    }
    drop(starter);
    drop(feed);
    while results.recv().await.is_some() {}
    while pumps.join_next().await.is_some() {}
}

/// Run `data` through the pipeline described by `definition`
pub async fn exchange(
    registry: &Arc<ModuleRegistry>,
    definition: &str,
    global: &GlobalFlags,
    data: Bytes,
) -> Result<Bytes> {
    let mut pipeline = Pipeline::parse(registry, definition)?;
    let ends = pipeline.init(global)?;
    pipeline.start();

    let (input_tx, input_rx) = stream_queue();
    let (output_tx, mut output_rx) = stream_queue();
    let feeder = tokio::spawn(async move {
        if !data.is_empty() {
            let _ = input_tx.send(data).await;
        }
    });
    let collector = tokio::spawn(async move {
        let mut collected = BytesMut::new();
        while let Some(chunk) = output_rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        collected.freeze()
    });

    drive(ends, Metadata::default(), input_rx, output_tx).await;
    pipeline.wait().await;
    let _ = feeder.await;
    Ok(collector.await.unwrap_or_default())
}
