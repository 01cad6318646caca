/**
 * Store building.
 *  Walks a directory, chunks every file into
 *  the shared store and emits an index.
 */
pub mod builder;
/**
 * Lifecycle events of a sync session and
 *  the listener registry they go through.
 */
pub mod events;
/**
 * Content addressing: nix-style sha256,
 *  folded to 20 bytes and base-32 encoded.
 */
pub mod hash;
/**
 * The index document, its node tree and
 *  closure computation.
 */
pub mod index;
/**
 * Rebuilds a bucket's tree from the store.
 */
pub mod linker;
pub mod scheduler;
/**
 * Top level sync state machine.
 *  check -> download -> link, with
 *  pause / resume / cancel in between.
 */
pub mod session;
/**
 * Where composables come from:
 *  http, local files and package registries
 */
pub mod source;
pub mod store;
/**
 * Per-chunk transfer state machine and the
 *  adapter contract transports implement.
 */
pub mod task;

pub mod prelude {
    pub use crate::builder::{build, BuildError, BuildOptions};
    pub use crate::events::{Event, EventBus, EventKind};
    pub use crate::hash::{HashMode, NixHash};
    pub use crate::index::{Composable, Index, Node};
    pub use crate::session::{sync, Outcome, Phase, Session, SyncError, SyncOptions};
    pub use crate::source::Source;
    pub use crate::store::Store;
}
