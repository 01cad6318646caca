use std::path::PathBuf;

use clap::Args;

use common::prelude::{build, BuildError, HashMode};

#[derive(Args, Debug, Clone)]
pub struct Build {
    /// Directory to publish, as one bucket named after it
    pub src: PathBuf,

    /// Output directory for `store/` and the index
    pub dst: PathBuf,

    /// Maximum bytes per composable
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Index file name, relative to the output directory
    #[arg(long)]
    pub index: Option<String>,

    #[arg(long)]
    pub hash_mode: Option<HashMode>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildOpError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Build {
    type Error = BuildOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut options = ctx.config.build.options();
        if let Some(chunk_size) = self.chunk_size {
            options.chunk_size = chunk_size;
        }
        if let Some(index) = &self.index {
            options.index = index.clone();
        }
        if let Some(hash_mode) = self.hash_mode {
            options.hash_mode = hash_mode;
        }

        tracing::info!(
            src = %self.src.display(),
            dst = %self.dst.display(),
            chunk_size = options.chunk_size,
            "building store"
        );
        let index = build(&self.src, &self.dst, &options).await?;
        tracing::info!(
            buckets = index.buckets.len(),
            composables = index.composables.len(),
            "store built"
        );

        Ok(self.dst.join(&options.index).display().to_string())
    }
}
