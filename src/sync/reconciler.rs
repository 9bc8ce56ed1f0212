// Paginated reconciler - drives page loads between the remote source and the cache
use std::future::Future;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::db::models::{Direction, Post, RemoteKey};
use crate::error::{SyncError, SyncResult};
use crate::remote::DynRemote;
use crate::store::{FeedStore, KeyUpdate};
use crate::sync::{new_gate, SyncGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Drop the cache and start over from the latest page.
    Refresh,
    /// Extend toward older posts.
    Append,
    /// Extend toward newer posts.
    Prepend,
}

impl LoadType {
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Before => LoadType::Append,
            Direction::After => LoadType::Prepend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub loaded: usize,
    /// No more pages in this direction. Terminal, not a failure.
    pub end_of_pagination: bool,
}

impl PageOutcome {
    fn exhausted() -> Self {
        Self {
            loaded: 0,
            end_of_pagination: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle { end_reached: bool },
    Loading,
    Error(SyncError),
}

impl Default for LoadState {
    fn default() -> Self {
        LoadState::Idle { end_reached: false }
    }
}

/// Load state per direction, as published to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStates {
    pub refresh: LoadState,
    pub append: LoadState,
    pub prepend: LoadState,
}

impl LoadStates {
    pub fn get(&self, load_type: LoadType) -> &LoadState {
        match load_type {
            LoadType::Refresh => &self.refresh,
            LoadType::Append => &self.append,
            LoadType::Prepend => &self.prepend,
        }
    }

    fn set(&mut self, load_type: LoadType, state: LoadState) {
        match load_type {
            LoadType::Refresh => self.refresh = state,
            LoadType::Append => self.append = state,
            LoadType::Prepend => self.prepend = state,
        }
    }
}

/// Translates "load more" requests into remote fetches and bookmark moves.
///
/// Loads are single-flight: a caller arriving while another load runs waits
/// for it, then loads from the bookmark it left behind. A failed load leaves
/// both the posts and the bookmarks untouched. Loads also wait for pending
/// optimistic mutations sharing the same [`SyncGate`].
pub struct Reconciler {
    store: FeedStore,
    remote: DynRemote,
    page_size: usize,
    gate: SyncGate,
    states: watch::Sender<LoadStates>,
}

impl Reconciler {
    pub fn new(store: FeedStore, remote: DynRemote, page_size: usize) -> Self {
        Self::with_gate(store, remote, page_size, new_gate())
    }

    pub fn with_gate(store: FeedStore, remote: DynRemote, page_size: usize, gate: SyncGate) -> Self {
        let (states, _) = watch::channel(LoadStates::default());
        Self {
            store,
            remote,
            page_size: page_size.max(1),
            gate,
            states,
        }
    }

    pub fn gate(&self) -> SyncGate {
        self.gate.clone()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadStates> {
        self.states.subscribe()
    }

    pub fn states(&self) -> LoadStates {
        self.states.borrow().clone()
    }

    pub async fn load(&self, load_type: LoadType) -> SyncResult<PageOutcome> {
        let _guard = self.gate.write().await;
        self.publish(load_type, LoadState::Loading);

        let result = match load_type {
            LoadType::Refresh => self.refresh().await,
            LoadType::Append => self.extend(Direction::Before).await,
            LoadType::Prepend => self.extend(Direction::After).await,
        };

        match &result {
            Ok(outcome) => self.publish(
                load_type,
                LoadState::Idle {
                    end_reached: outcome.end_of_pagination,
                },
            ),
            Err(err) => {
                tracing::warn!("{:?} load failed: {}", load_type, err);
                self.publish(load_type, LoadState::Error(err.clone()));
            }
        }
        result
    }

    /// `load`, abandoned when `cancel` fires. Every store write is a single
    /// transaction, so abandoning never leaves a partial page behind.
    pub async fn load_cancellable(
        &self,
        load_type: LoadType,
        cancel: &CancellationToken,
    ) -> SyncResult<PageOutcome> {
        self.until_cancelled(load_type, cancel, self.load(load_type))
            .await
    }

    /// `sync_all`, abandoned when `cancel` fires.
    pub async fn sync_all_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> SyncResult<PageOutcome> {
        self.until_cancelled(LoadType::Refresh, cancel, self.sync_all())
            .await
    }

    async fn until_cancelled<F>(
        &self,
        load_type: LoadType,
        cancel: &CancellationToken,
        work: F,
    ) -> SyncResult<PageOutcome>
    where
        F: Future<Output = SyncResult<PageOutcome>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.publish(load_type, LoadState::default());
                Err(SyncError::Cancelled)
            }
            result = work => result,
        }
    }

    /// Replace the cache with the backend's complete post list.
    pub async fn sync_all(&self) -> SyncResult<PageOutcome> {
        let _guard = self.gate.write().await;
        self.publish(LoadType::Refresh, LoadState::Loading);

        let result = self.replace_with(self.remote.fetch_all().await).await;
        match &result {
            Ok(_) => self.publish(LoadType::Refresh, LoadState::default()),
            Err(err) => self.publish(LoadType::Refresh, LoadState::Error(err.clone())),
        }
        result
    }

    /// Merge posts discovered outside of paging (the newer-posts buffer) and
    /// advance the `After` bookmark to the newest post known. Returns the
    /// new anchor.
    pub async fn merge_newer(&self, posts: &[Post]) -> SyncResult<Option<i64>> {
        let _guard = self.gate.write().await;

        let Some((newest, _)) = boundaries(posts) else {
            return Ok(None);
        };
        // The key only moves forward; a prepend may already be past `newest`.
        let current = self
            .store
            .remote_key(Direction::After)?
            .map(|key| key.anchor_id);
        let anchor = [Some(newest), current, self.store.newest_id()?]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(newest);
        self.store.append_page(
            posts,
            KeyUpdate::Set(RemoteKey::new(Direction::After, anchor)),
        )?;
        tracing::info!("Merged {} newer posts, after-key now {}", posts.len(), anchor);
        Ok(Some(anchor))
    }

    async fn refresh(&self) -> SyncResult<PageOutcome> {
        let fetched = self.remote.fetch_latest(self.page_size).await;
        self.replace_with(fetched).await
    }

    async fn replace_with(
        &self,
        fetched: crate::remote::RemoteResult<Vec<Post>>,
    ) -> SyncResult<PageOutcome> {
        let posts = fetched?;
        let keys = match boundaries(&posts) {
            Some((newest, oldest)) => vec![
                RemoteKey::new(Direction::After, newest),
                RemoteKey::new(Direction::Before, oldest),
            ],
            None => Vec::new(),
        };
        self.store.replace_all(&posts, &keys)?;
        tracing::info!("Refreshed feed with {} posts", posts.len());

        Ok(PageOutcome {
            loaded: posts.len(),
            end_of_pagination: posts.is_empty(),
        })
    }

    async fn extend(&self, direction: Direction) -> SyncResult<PageOutcome> {
        let Some(key) = self.store.remote_key(direction)? else {
            tracing::debug!("No {} key; pagination finished", direction);
            return Ok(PageOutcome::exhausted());
        };

        let posts = match direction {
            Direction::Before => {
                self.remote
                    .fetch_before(key.anchor_id, self.page_size)
                    .await?
            }
            Direction::After => {
                self.remote
                    .fetch_after(key.anchor_id, self.page_size)
                    .await?
            }
        };

        let exhausted = posts.len() < self.page_size;
        let next_anchor = boundaries(&posts).map(|(newest, oldest)| match direction {
            Direction::Before => oldest,
            Direction::After => newest,
        });
        let update = match next_anchor {
            Some(anchor) if !exhausted => KeyUpdate::Set(RemoteKey::new(direction, anchor)),
            _ => KeyUpdate::Remove(direction),
        };
        self.store.append_page(&posts, update)?;

        tracing::debug!(
            "Loaded {} posts {} {} (exhausted: {})",
            posts.len(),
            direction,
            key.anchor_id,
            exhausted
        );
        Ok(PageOutcome {
            loaded: posts.len(),
            end_of_pagination: exhausted,
        })
    }

    fn publish(&self, load_type: LoadType, state: LoadState) {
        self.states.send_modify(|states| states.set(load_type, state));
    }
}

/// `(newest id, oldest id)` of a page in canonical order.
fn boundaries(posts: &[Post]) -> Option<(i64, i64)> {
    let newest = posts.iter().max_by_key(|p| p.order_key())?;
    let oldest = posts.iter().min_by_key(|p| p.order_key())?;
    Some((newest.id, oldest.id))
}
