use anyhow::{Context, Result};
use clap::error::ErrorKind;
use piperelay::{parse_command_line, GlobalFlags, ModuleRegistry, Pipeline, PipelineError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal error");
            1
        }
    };
    // Standard input may still be blocked in a read that cannot be cancelled
    std::process::exit(code)
}

async fn run() -> Result<i32> {
    let registry = ModuleRegistry::builtin().context("Failed to register modules")?;
    let argv: Vec<String> = std::env::args().collect();

    let command_line = match parse_command_line(&argv, &registry.help()) {
        Ok(command_line) => command_line,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return Ok(0);
        }
        Err(err) => {
            init_tracing(false);
            error!(error = %err.kind(), "Error parsing global flags");
            let _ = err.print();
            return Ok(3);
        }
    };

    init_tracing(command_line.global.log_json);
    let global: &GlobalFlags = &command_line.global;
    if global.max_concurrent_streams == 0 {
        error!("Flag --max-concurrent-streams must be at least 1");
        return Ok(3);
    }

    let modules = command_line.pipeline_modules();
    if modules.is_empty() {
        eprintln!("{}", registry.help());
        return Ok(2);
    }

    let pipeline = match Pipeline::from_specs(&registry, &modules) {
        Ok(pipeline) => pipeline,
        Err(PipelineError::Flags { module, source }) => {
            if !matches!(source.kind(), ErrorKind::DisplayHelp) {
                error!(module = %module, "Error parsing module flags");
            }
            source.exit();
        }
        Err(err @ PipelineError::ModuleNotFound(_)) => {
            error!(error = %err, "Unknown module");
            eprintln!("{}", registry.help());
            return Ok(2);
        }
        Err(err) => return Err(err).context("Failed to build pipeline"),
    };

    info!(version = piperelay::VERSION, modules = modules.len(), "starting");
    pipeline
        .run(global)
        .await
        .context("Failed to initialize pipeline")?;
    Ok(0)
}
