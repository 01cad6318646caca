pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nereid")]
#[command(about = "Build content-addressed stores and sync them from many sources")]
#[command(version)]
pub struct Args {
    /// Path to the config file (defaults to ~/.nereid/config.toml)
    #[arg(long = "config", global = true)]
    pub config_path: Option<PathBuf>,

    /// Log level, overrides the config file. `RUST_LOG` refines it further
    #[arg(long, global = true)]
    pub log_level: Option<tracing::Level>,

    #[command(subcommand)]
    pub command: crate::Command,
}
