pub mod mutation;
pub mod poller;
pub mod reconciler;

use std::sync::Arc;
use tokio::sync::RwLock;

pub use mutation::{MutationCoordinator, NewPost, OptimisticWrite, Upload};
pub use poller::{NewerPoller, PollEvent};
pub use reconciler::{LoadState, LoadStates, LoadType, PageOutcome, Reconciler};

/// Orders writers of the cache. Page loads hold it exclusively; an
/// optimistic mutation holds it shared from its local write until it
/// settles, so a refresh lands wholly before or after a mutation.
pub type SyncGate = Arc<RwLock<()>>;

pub fn new_gate() -> SyncGate {
    Arc::new(RwLock::new(()))
}
