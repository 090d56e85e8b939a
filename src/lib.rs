//! Piperelay - composable byte-stream pipelines
//!
//! Modules are chained on the command line and exchange logical byte
//! streams over bounded control queues. The flagship module is a TLS
//! listener that decides per connection, after reading the ClientHello,
//! whether to relay the raw bytes or to terminate TLS with a leaf
//! certificate issued on the fly.
//!
//! ## Features
//!
//! - **Stream multiplexing**: any number of logical streams over one pair of
//!   control queues, with lazy start and backpressure
//! - **Two-phase shutdown**: every module drains its input before closing its
//!   output, so neighbours never race
//! - **Nested pipelines**: definitions like `"upper -- stdout"` can be run
//!   from inside a module
//! - **TLS interception**: template-driven decrypt decision, ECDSA P-256 leaf
//!   certificates, byte-exact passthrough
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use piperelay::{exchange, GlobalFlags, ModuleRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ModuleRegistry::builtin()?;
//!     let output = exchange(
//!         &registry,
//!         "upper",
//!         &GlobalFlags::default(),
//!         Bytes::from_static(b"abc\n"),
//!     )
//!     .await?;
//!     assert_eq!(&output[..], b"ABC\n");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `message` - control messages, stream negotiation, chunked reading
//! - `module` - module trait and the shared control loop
//! - `pipeline` - assembly, relays, ring execution, nested pipelines
//! - `registry` - module constructors and the process standard streams
//! - `modules` - built-in modules
//! - `tls` - TLS listener and certificate authority

pub mod config;
pub mod error;
pub mod message;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod registry;
pub mod tls;

/// Configuration types
pub use config::{parse_command_line, CommandLine, GlobalFlags, ModuleSpec};

/// Errors
pub use error::{ModuleError, PipelineError};

/// Message protocol
pub use message::{announce, drain, Announce, Message, Metadata, StreamStarter};

/// Module contract
pub use module::{serve_streams, Module, ModuleIo, StreamHandler, Worker};

/// Pipeline assembly
pub use pipeline::{drive, exchange, Pipeline, PipelineEnds};

/// Module registry
pub use registry::ModuleRegistry;

/// TLS interception
pub use tls::{CertificateAuthority, TlsArgs, TlsServer};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
