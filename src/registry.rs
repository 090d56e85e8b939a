//! Module registry
//!
//! Maps module names to constructors and owns the process-wide standard
//! streams. Standard input is read by a single background reader shared by
//! every stdin module; standard output may be claimed by one live module at
//! a time.

use crate::error::{ModuleError, PipelineError, Result};
use crate::message::{read_chunks, stream_queue, StreamReceiver};
use crate::module::Module;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Arguments handed to a module constructor
pub struct ModuleArgs<'a> {
    /// Flags following the module name
    pub args: &'a [String],
    /// Registry the module was created from
    pub registry: &'a Arc<ModuleRegistry>,
}

/// Parses flags and builds a module without side effects
pub type Constructor = fn(ModuleArgs<'_>) -> std::result::Result<Box<dyn Module>, clap::Error>;

struct Entry {
    description: &'static str,
    constructor: Constructor,
}

/// Name to constructor map
pub struct ModuleRegistry {
    modules: BTreeMap<&'static str, Entry>,
    stdio: Arc<Stdio>,
}

impl ModuleRegistry {
    /// Empty registry bound to the process standard streams
    pub fn new() -> Self {
        Self::with_stdio(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    }

    /// Empty registry bound to custom standard streams
    pub fn with_stdio(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            modules: BTreeMap::new(),
            stdio: Arc::new(Stdio::new(reader, writer)),
        }
    }

    /// Registry holding every built-in module
    pub fn builtin() -> Result<Arc<Self>> {
        let mut registry = Self::new();
        crate::modules::register_builtin(&mut registry)?;
        Ok(Arc::new(registry))
    }

    /// Built-in modules with custom standard streams
    pub fn builtin_with_stdio(reader: BoxedReader, writer: BoxedWriter) -> Result<Arc<Self>> {
        let mut registry = Self::with_stdio(reader, writer);
        crate::modules::register_builtin(&mut registry)?;
        Ok(Arc::new(registry))
    }

    /// Register a module; names are unique
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        constructor: Constructor,
    ) -> Result<()> {
        if self.modules.contains_key(name) {
            return Err(PipelineError::DuplicateModule(name.to_string()));
        }
        self.modules.insert(
            name,
            Entry {
                description,
                constructor,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    /// Build a module from its name and flags
    pub fn create(self: &Arc<Self>, name: &str, args: &[String]) -> Result<Box<dyn Module>> {
        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| PipelineError::ModuleNotFound(name.to_string()))?;
        (entry.constructor)(ModuleArgs {
            args,
            registry: self,
        })
        .map_err(|source| PipelineError::flags(name, source))
    }

    /// Module listing for help output
    pub fn help(&self) -> String {
        let width = self.modules.keys().map(|n| n.len()).max().unwrap_or(0);
        let mut help = String::from("Modules:\n");
        for (name, entry) in &self.modules {
            let _ = writeln!(help, "  {name:<width$}  {}", entry.description);
        }
        help.push_str("\nUse `-- <module> --help` for module flags.");
        help
    }

    pub fn stdio(&self) -> &Arc<Stdio> {
        &self.stdio
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct StdioState {
    reader: Option<BoxedReader>,
    stdin: Option<Arc<SharedStdin>>,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    stdout_claimed: bool,
}

/// Process-wide standard streams
pub struct Stdio {
    state: Mutex<StdioState>,
}

impl Stdio {
    fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            state: Mutex::new(StdioState {
                reader: Some(reader),
                stdin: None,
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                stdout_claimed: false,
            }),
        }
    }

    /// Shared standard input, starting its reader on first use
    pub fn claim_stdin(&self) -> std::result::Result<Arc<SharedStdin>, ModuleError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModuleError::Unavailable("stdin"))?;
        if let Some(shared) = &state.stdin {
            return Ok(Arc::clone(shared));
        }
        let reader = state
            .reader
            .take()
            .ok_or(ModuleError::Unavailable("stdin"))?;
        let shared = Arc::new(SharedStdin::spawn(reader));
        state.stdin = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// Exclusive standard output, released when the claim is dropped
    pub fn claim_stdout(self: &Arc<Self>) -> std::result::Result<StdoutClaim, ModuleError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModuleError::Unavailable("stdout"))?;
        if state.stdout_claimed {
            return Err(ModuleError::AlreadyClaimed("stdout"));
        }
        state.stdout_claimed = true;
        Ok(StdoutClaim {
            writer: Arc::clone(&state.writer),
            stdio: Arc::clone(self),
        })
    }
}

/// Exclusive handle on standard output
pub struct StdoutClaim {
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    stdio: Arc<Stdio>,
}

impl StdoutClaim {
    pub fn writer(&self) -> &tokio::sync::Mutex<BoxedWriter> {
        &self.writer
    }
}

impl Drop for StdoutClaim {
    fn drop(&mut self) {
        if let Ok(mut state) = self.stdio.state.lock() {
            state.stdout_claimed = false;
        }
    }
}

/// Standard input chunks produced by one background reader
///
/// Streams take turns: whoever holds the lock owns the input until it
/// releases it or the input ends.
pub struct SharedStdin {
    chunks: tokio::sync::Mutex<StreamReceiver>,
}

impl SharedStdin {
    fn spawn(mut reader: BoxedReader) -> Self {
        let (tx, rx) = stream_queue();
        tokio::spawn(async move {
            match read_chunks(&mut reader, &tx).await {
                Ok(total) => debug!(bytes = total, "stdin reached end of input"),
                Err(err) => debug!(error = %err, "stdin reader stopped"),
            }
        });
        Self {
            chunks: tokio::sync::Mutex::new(rx),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, StreamReceiver> {
        self.chunks.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalFlags;
    use crate::module::{ModuleIo, Worker};

    struct Noop;

    impl Module for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn init(
            self: Box<Self>,
            _io: ModuleIo,
            _global: &GlobalFlags,
        ) -> std::result::Result<Worker, ModuleError> {
            Ok(Box::pin(async {}))
        }
    }

    fn noop(_args: ModuleArgs<'_>) -> std::result::Result<Box<dyn Module>, clap::Error> {
        Ok(Box::new(Noop))
    }

    fn empty_registry() -> ModuleRegistry {
        ModuleRegistry::with_stdio(Box::new(tokio::io::empty()), Box::new(tokio::io::sink()))
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = empty_registry();
        registry.register("noop", "does nothing", noop).unwrap();
        let err = registry.register("noop", "again", noop).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateModule(name) if name == "noop"));
    }

    #[test]
    fn test_unknown_module() {
        let registry = Arc::new(empty_registry());
        let err = registry.create("missing", &[]).err().unwrap();
        assert!(matches!(err, PipelineError::ModuleNotFound(_)));
    }

    #[test]
    fn test_help_lists_builtin_modules() {
        let registry = ModuleRegistry::builtin_with_stdio(
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
        )
        .unwrap();
        let help = registry.help();
        for name in ["stdin", "stdout", "upper", "lower", "null", "tee", "tls"] {
            assert!(registry.contains(name));
            assert!(help.contains(name), "{name} missing from help");
        }
    }

    #[test]
    fn test_stdout_claimed_once() {
        let registry = empty_registry();
        let first = registry.stdio().claim_stdout().unwrap();
        assert!(matches!(
            registry.stdio().claim_stdout(),
            Err(ModuleError::AlreadyClaimed("stdout"))
        ));
        drop(first);
        assert!(registry.stdio().claim_stdout().is_ok());
    }

    #[tokio::test]
    async fn test_stdin_is_shared() {
        let registry = empty_registry();
        let first = registry.stdio().claim_stdin().unwrap();
        let second = registry.stdio().claim_stdin().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.lock().await.recv().await.is_none());
    }
}
