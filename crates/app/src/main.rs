// CLI modules
mod cli;
mod config;
mod logging;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, op::OpContext};
use config::AppConfig;

command_enum! {
    (Build, cli::ops::Build),
    (Sync, cli::ops::Sync),
}

/// Load the config and start logging. Any failure here happens
///  before tracing is up, so it is reported on stderr by `main`.
fn setup(args: &Args) -> anyhow::Result<(OpContext, Vec<tracing_appender::non_blocking::WorkerGuard>)> {
    let config = AppConfig::load(args.config_path.as_deref()).context("failed to load config")?;

    let level = match (args.log_level, config.log.level.as_deref()) {
        (Some(level), _) => level,
        (None, Some(level)) => level
            .parse()
            .with_context(|| format!("invalid log level in config: {}", level))?,
        (None, None) => tracing::Level::INFO,
    };
    let guards = logging::init_logging(level, config.log.dir.as_deref());

    Ok((OpContext::new(config), guards))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (ctx, guards) = match setup(&args) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = args.command.execute(&ctx).await;
    // flush buffered log lines before exiting
    drop(guards);

    match result {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
