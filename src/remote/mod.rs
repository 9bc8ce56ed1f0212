mod http;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use crate::db::models::{MediaRef, Post};

pub use self::http::HttpRemote;

/// Classified failure of a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// The feed backend, independent of transport.
///
/// List endpoints return posts newest first.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_all(&self) -> RemoteResult<Vec<Post>>;

    async fn fetch_latest(&self, count: usize) -> RemoteResult<Vec<Post>>;

    /// Up to `count` posts older than `id`.
    async fn fetch_before(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>>;

    /// Up to `count` posts immediately newer than `id`.
    async fn fetch_after(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>>;

    /// Every post newer than `id`.
    async fn fetch_newer(&self, id: i64) -> RemoteResult<Vec<Post>>;

    /// Create a post; the server assigns its id.
    async fn create(&self, post: Post) -> RemoteResult<Post>;

    /// Save changes to an existing post. The backend serves create and
    /// update from the same endpoint.
    async fn update(&self, post: Post) -> RemoteResult<Post> {
        self.create(post).await
    }

    async fn delete(&self, id: i64) -> RemoteResult<()>;

    async fn like(&self, id: i64) -> RemoteResult<Post>;

    async fn unlike(&self, id: i64) -> RemoteResult<Post>;

    async fn upload_attachment(&self, bytes: Bytes, filename: &str) -> RemoteResult<MediaRef>;
}

/// Type alias for Arc-wrapped remote source
pub type DynRemote = Arc<dyn RemoteSource>;
