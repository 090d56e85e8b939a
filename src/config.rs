//! Command line configuration
//!
//! The command line is split on standalone `--` tokens. The first segment
//! holds the global flags, every following segment names a module and its
//! own flags:
//!
//! ```text
//! piperelay [global flags] -- <module> [flags] -- <module> [flags] ...
//! ```

use clap::{CommandFactory, FromArgMatches, Parser};

/// Default cap on streams served concurrently by one module
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 64;

/// Token separating pipeline segments
pub const MODULE_SEPARATOR: &str = "--";

/// Flags shared by every module of a pipeline
#[derive(Debug, Clone, Parser)]
#[command(
    name = "piperelay",
    version,
    about = "Chain byte-stream modules into a pipeline",
    override_usage = "piperelay [OPTIONS] -- <module> [flags] -- <module> [flags] ..."
)]
pub struct GlobalFlags {
    /// Keep modules alive for multiple streams instead of exiting after the first one
    #[arg(long, env = "PIPERELAY_MULTI_STREAMS")]
    pub multi_streams: bool,

    /// Maximum number of streams a module serves at the same time
    #[arg(
        long,
        env = "PIPERELAY_MAX_CONCURRENT_STREAMS",
        default_value_t = DEFAULT_MAX_CONCURRENT_STREAMS
    )]
    pub max_concurrent_streams: usize,

    /// Wrap the pipeline with stdin and stdout modules
    #[arg(long)]
    pub std: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "PIPERELAY_LOG_JSON")]
    pub log_json: bool,
}

impl Default for GlobalFlags {
    fn default() -> Self {
        Self {
            multi_streams: false,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            std: false,
            log_json: false,
        }
    }
}

impl GlobalFlags {
    /// Flags for a multi-stream pipeline
    pub fn multi_streams() -> Self {
        Self {
            multi_streams: true,
            ..Self::default()
        }
    }

    /// Concurrency cap, never below one
    pub fn stream_limit(&self) -> usize {
        self.max_concurrent_streams.max(1)
    }
}

/// One module segment of the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

/// Parsed command line
#[derive(Debug, Clone)]
pub struct CommandLine {
    pub global: GlobalFlags,
    pub modules: Vec<ModuleSpec>,
}

impl CommandLine {
    /// Module list with stdin/stdout wrapping applied
    pub fn pipeline_modules(&self) -> Vec<ModuleSpec> {
        if !self.global.std {
            return self.modules.clone();
        }
        let mut modules = Vec::with_capacity(self.modules.len() + 2);
        modules.push(ModuleSpec::new("stdin"));
        modules.extend(self.modules.iter().cloned());
        modules.push(ModuleSpec::new("stdout"));
        modules
    }
}

/// Split words into module segments on `--`
///
/// Empty segments are skipped, so leading, trailing and doubled separators
/// are harmless.
pub fn split_modules<S: AsRef<str>>(words: &[S]) -> Vec<ModuleSpec> {
    words
        .split(|word| word.as_ref() == MODULE_SEPARATOR)
        .filter_map(|segment| {
            let (name, args) = segment.split_first()?;
            Some(ModuleSpec {
                name: name.as_ref().to_string(),
                args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            })
        })
        .collect()
}

/// Parse `argv` (including the program name)
///
/// `module_help` is appended to the global help text.
pub fn parse_command_line<S: AsRef<str>>(
    argv: &[S],
    module_help: &str,
) -> Result<CommandLine, clap::Error> {
    let split = argv
        .iter()
        .position(|word| word.as_ref() == MODULE_SEPARATOR)
        .unwrap_or(argv.len());
    let (global_words, module_words) = argv.split_at(split);

    let matches = GlobalFlags::command()
        .after_help(module_help.to_string())
        .try_get_matches_from(global_words.iter().map(|w| w.as_ref().to_string()))?;
    let global = GlobalFlags::from_arg_matches(&matches)?;

    Ok(CommandLine {
        global,
        modules: split_modules(module_words),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_split_modules() {
        let modules = split_modules(&words("-- tls --listen :8443 -- upper -- -- stdout --"));
        assert_eq!(
            modules,
            vec![
                ModuleSpec {
                    name: "tls".into(),
                    args: vec!["--listen".into(), ":8443".into()],
                },
                ModuleSpec::new("upper"),
                ModuleSpec::new("stdout"),
            ]
        );
    }

    #[test]
    fn test_parse_global_flags() {
        let line = parse_command_line(
            &words("piperelay --multi-streams --max-concurrent-streams 8 -- upper"),
            "",
        )
        .unwrap();
        assert!(line.global.multi_streams);
        assert_eq!(line.global.max_concurrent_streams, 8);
        assert_eq!(line.modules, vec![ModuleSpec::new("upper")]);
    }

    #[test]
    fn test_defaults() {
        let line = parse_command_line(&words("piperelay"), "").unwrap();
        assert!(!line.global.std);
        assert_eq!(
            line.global.max_concurrent_streams,
            DEFAULT_MAX_CONCURRENT_STREAMS
        );
        assert!(line.modules.is_empty());
    }

    #[test]
    fn test_std_wraps_pipeline() {
        let line = parse_command_line(&words("piperelay --std -- upper"), "").unwrap();
        let names: Vec<_> = line
            .pipeline_modules()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, ["stdin", "upper", "stdout"]);
    }

    #[test]
    fn test_unknown_global_flag() {
        let err = parse_command_line(&words("piperelay --bogus -- upper"), "").unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_stream_limit_floor() {
        let flags = GlobalFlags {
            max_concurrent_streams: 0,
            ..GlobalFlags::default()
        };
        assert_eq!(flags.stream_limit(), 1);
    }
}
