//! The feed as the presentation layer sees it.
//!
//! [`Feed`] owns the cache, the reconciler, the mutation coordinator and the
//! newer-posts poller, and hands out decorated items plus the signals a UI
//! needs (load state per direction, number of buffered newer posts).

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FeedConfig;
use crate::db::models::{Direction, Post};
use crate::error::SyncResult;
use crate::projection::{Boundary, FillerConfig, Projection, Projector};
use crate::remote::DynRemote;
use crate::store::{FeedStore, PostCursor};
use crate::sync::{
    LoadStates, LoadType, MutationCoordinator, NewPost, NewerPoller, PageOutcome, PollEvent,
    Reconciler,
};

/// Decorated items over the whole cache, read lazily.
pub type FeedItems = Projection<PostCursor>;

pub struct Feed {
    store: FeedStore,
    reconciler: Arc<Reconciler>,
    mutations: MutationCoordinator,
    poller: Arc<NewerPoller>,
    filler: FillerConfig,
    cancel: CancellationToken,
}

impl Feed {
    pub fn new(store: FeedStore, remote: DynRemote, config: &FeedConfig) -> Self {
        let reconciler = Reconciler::new(store.clone(), remote.clone(), config.page_size);
        let mutations =
            MutationCoordinator::with_gate(store.clone(), remote.clone(), reconciler.gate());
        let poller = NewerPoller::new(store.clone(), remote, config.poll_interval());
        Self {
            store,
            reconciler: Arc::new(reconciler),
            mutations,
            poller: Arc::new(poller),
            filler: config.filler(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    /// Display items, newest first. Each call projects against today's date.
    pub fn items(&self) -> FeedItems {
        self.items_with(&Projector::local(self.filler.clone()))
    }

    pub fn items_with(&self, projector: &Projector) -> FeedItems {
        projector.project(
            self.store.cursor(self.reconciler.page_size()),
            Boundary::Complete,
        )
    }

    pub fn load_states(&self) -> watch::Receiver<LoadStates> {
        self.reconciler.subscribe()
    }

    pub fn buffered_count(&self) -> usize {
        self.poller.buffered_count()
    }

    pub fn watch_buffered_count(&self) -> watch::Receiver<usize> {
        self.poller.watch_count()
    }

    pub fn poll_events(&self) -> broadcast::Receiver<PollEvent> {
        self.poller.subscribe()
    }

    pub async fn refresh(&self) -> SyncResult<PageOutcome> {
        self.reconciler
            .load_cancellable(LoadType::Refresh, &self.cancel)
            .await
    }

    /// `Before` loads older posts, `After` newer ones.
    pub async fn load_more(&self, direction: Direction) -> SyncResult<PageOutcome> {
        self.reconciler
            .load_cancellable(LoadType::for_direction(direction), &self.cancel)
            .await
    }

    pub async fn sync_all(&self) -> SyncResult<PageOutcome> {
        self.reconciler.sync_all_cancellable(&self.cancel).await
    }

    pub async fn like(&self, id: i64) -> SyncResult<Post> {
        self.mutations.like(id).await
    }

    pub async fn unlike(&self, id: i64) -> SyncResult<Post> {
        self.mutations.unlike(id).await
    }

    pub async fn delete(&self, id: i64) -> SyncResult<()> {
        self.mutations.delete(id).await
    }

    pub async fn create(&self, draft: NewPost) -> SyncResult<Post> {
        self.mutations.create(draft).await
    }

    pub async fn edit(&self, id: i64, content: impl Into<String>) -> SyncResult<Post> {
        self.mutations.edit(id, content.into()).await
    }

    /// Show buffered newer posts: merge them into the cache.
    pub async fn flush_newer(&self) -> SyncResult<usize> {
        let merged = self.poller.flush(&self.reconciler).await?;
        if merged > 0 {
            tracing::info!("Showing {} newer posts", merged);
        }
        Ok(merged)
    }

    pub async fn discard_newer(&self) -> usize {
        self.poller.discard().await
    }

    /// Start the newer-posts poller. It stops on [`shutdown`](Self::shutdown).
    pub fn spawn_poller(&self) -> JoinHandle<()> {
        let poller = self.poller.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { poller.run(cancel).await })
    }

    /// Cancel the poller and any load in flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
