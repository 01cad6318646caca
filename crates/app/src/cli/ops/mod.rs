mod build;
mod sync;

pub use build::Build;
pub use sync::Sync;
