// Background poller for posts newer than the cache
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::db::models::Post;
use crate::error::{SyncError, SyncResult};
use crate::remote::DynRemote;
use crate::store::FeedStore;
use crate::sync::Reconciler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// A poll succeeded; `fetched` new posts, `total` now buffered.
    Buffered { fetched: usize, total: usize },
    Failed(SyncError),
}

/// Periodically asks the backend for posts newer than anything seen and
/// holds them in memory until the user asks to see them.
pub struct NewerPoller {
    store: FeedStore,
    remote: DynRemote,
    interval: Duration,
    buffer: Mutex<Vec<Post>>,
    count: watch::Sender<usize>,
    events: broadcast::Sender<PollEvent>,
}

impl NewerPoller {
    pub fn new(store: FeedStore, remote: DynRemote, interval: Duration) -> Self {
        let (count, _) = watch::channel(0);
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            remote,
            interval,
            buffer: Mutex::new(Vec::new()),
            count,
            events,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn buffered_count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    /// Poll every `interval` until `cancel` fires. Failures are reported and
    /// the loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Polling for newer posts every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            if let Err(err) = result {
                tracing::warn!("Newer-posts poll failed: {}", err);
                let _ = self.events.send(PollEvent::Failed(err));
            }
        }

        tracing::info!("Newer-posts poller stopped");
    }

    /// One poll cycle. Returns how many previously unseen posts were buffered.
    pub async fn poll_once(&self) -> SyncResult<usize> {
        let cached = self.store.newest_id()?;
        let buffered = self.buffer.lock().await.iter().map(|p| p.id).max();
        let Some(anchor) = cached.max(buffered) else {
            tracing::debug!("Cache is empty; nothing to poll against");
            return Ok(0);
        };

        let fetched = self.remote.fetch_newer(anchor).await?;

        let mut buffer = self.buffer.lock().await;
        let known: HashSet<i64> = buffer.iter().map(|p| p.id).collect();
        let before = buffer.len();
        buffer.extend(fetched.into_iter().filter(|p| !known.contains(&p.id)));
        let added = buffer.len() - before;
        let total = buffer.len();
        drop(buffer);

        self.count.send_replace(total);
        if added > 0 {
            tracing::info!("{} newer posts waiting ({} total)", added, total);
        }
        let _ = self.events.send(PollEvent::Buffered {
            fetched: added,
            total,
        });
        Ok(added)
    }

    /// Merge the buffer into the cache through `reconciler`. The buffer is
    /// kept when the merge fails.
    pub async fn flush(&self, reconciler: &Reconciler) -> SyncResult<usize> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(0);
        }

        reconciler.merge_newer(&buffer).await?;
        let merged = buffer.len();
        buffer.clear();
        drop(buffer);

        self.count.send_replace(0);
        Ok(merged)
    }

    /// Forget buffered posts without showing them.
    pub async fn discard(&self) -> usize {
        let dropped = std::mem::take(&mut *self.buffer.lock().await).len();
        self.count.send_replace(0);
        dropped
    }
}
