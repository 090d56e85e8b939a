//! Built-in modules
//!
//! - `stdin` / `stdout` - process standard streams
//! - `upper` / `lower` - ASCII case transforms
//! - `null` - discards its input
//! - `tee` - copies every stream into a nested pipeline
//! - `tls` - TLS listener that relays or intercepts connections

pub mod case;
pub mod null;
pub mod stdio;
pub mod tee;

use crate::error::Result;
use crate::registry::ModuleRegistry;

/// Register every built-in module
pub fn register_builtin(registry: &mut ModuleRegistry) -> Result<()> {
    registry.register("stdin", "Reads from stdin", stdio::construct_stdin)?;
    registry.register("stdout", "Writes to stdout", stdio::construct_stdout)?;
    registry.register("upper", "Uppercases ASCII letters", case::construct_upper)?;
    registry.register("lower", "Lowercases ASCII letters", case::construct_lower)?;
    registry.register("null", "Discards input", null::construct)?;
    registry.register(
        "tee",
        "Copies each stream into a nested pipeline",
        tee::construct,
    )?;
    registry.register(
        "tls",
        "TLS server that relays or decrypts each connection",
        crate::tls::construct,
    )?;
    Ok(())
}
