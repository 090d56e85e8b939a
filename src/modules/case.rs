//! ASCII case transforms

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{drain, Metadata, StreamReceiver, StreamSender};
use crate::module::{serve_streams, Module, ModuleIo, StreamHandler, Worker};
use crate::registry::ModuleArgs;
use bytes::Bytes;
use clap::Parser;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "upper", no_binary_name = true, about = "Uppercases ASCII letters")]
struct UpperArgs {}

#[derive(Debug, Parser)]
#[command(name = "lower", no_binary_name = true, about = "Lowercases ASCII letters")]
struct LowerArgs {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Upper,
    Lower,
}

impl Case {
    fn name(self) -> &'static str {
        match self {
            Case::Upper => "upper",
            Case::Lower => "lower",
        }
    }

    pub fn apply(self, chunk: &[u8]) -> Bytes {
        match self {
            Case::Upper => Bytes::from(chunk.to_ascii_uppercase()),
            Case::Lower => Bytes::from(chunk.to_ascii_lowercase()),
        }
    }
}

pub fn construct_upper(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    UpperArgs::try_parse_from(args.args)?;
    Ok(Box::new(CaseModule { case: Case::Upper }))
}

pub fn construct_lower(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    LowerArgs::try_parse_from(args.args)?;
    Ok(Box::new(CaseModule { case: Case::Lower }))
}

/// Rewrites every chunk with the configured case
#[derive(Debug)]
pub struct CaseModule {
    case: Case,
}

impl CaseModule {
    pub fn new(case: Case) -> Self {
        Self { case }
    }
}

impl Module for CaseModule {
    fn name(&self) -> &'static str {
        self.case.name()
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        let name = self.case.name();
        Ok(Box::pin(serve_streams(
            name,
            Arc::new(CaseHandler(self.case)),
            io,
            global.multi_streams,
        )))
    }
}

struct CaseHandler(Case);

impl StreamHandler for CaseHandler {
    fn handle(
        self: Arc<Self>,
        _metadata: Metadata,
        mut inbound: StreamReceiver,
        outbound: StreamSender,
    ) -> impl Future<Output = ()> + Send {
        async move {
            while let Some(chunk) = inbound.recv().await {
                if outbound.send(self.0.apply(&chunk)).await.is_err() {
                    break;
                }
            }
            drop(outbound);
            drain(inbound).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_leaves_non_ascii_alone() {
        let input = "abc\u{e9}XYZ 123\n".as_bytes();
        assert_eq!(&Case::Upper.apply(input)[..], "ABC\u{e9}XYZ 123\n".as_bytes());
        assert_eq!(&Case::Lower.apply(input)[..], "abc\u{e9}xyz 123\n".as_bytes());
    }
}
