// Library exports for feedsync
// The binary and integration tests build on these modules

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod projection;
pub mod remote;
pub mod store;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{SyncError, SyncResult};
pub use feed::Feed;
