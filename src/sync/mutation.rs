// Optimistic mutations - apply locally, confirm remotely, roll back on failure
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::db::models::{Attachment, AttachmentKind, Post};
use crate::error::{SyncError, SyncResult};
use crate::remote::{DynRemote, RemoteError};
use crate::store::FeedStore;
use crate::sync::{new_gate, SyncGate};

/// A local write awaiting the server's verdict.
///
/// Holds the row as it was before the write and as the write left it. It
/// must be settled with [`commit`](Self::commit) or [`revert`](Self::revert);
/// one dropped unsettled (its mutation future was cancelled) reverts itself.
///
/// Reverting is conditional: when the row no longer matches what this write
/// left behind, a later write owns it and the revert is skipped.
pub struct OptimisticWrite {
    store: FeedStore,
    id: i64,
    before: Option<Post>,
    applied: Option<Post>,
    settled: bool,
}

impl OptimisticWrite {
    pub fn update<F>(store: &FeedStore, id: i64, change: F) -> SyncResult<Self>
    where
        F: FnOnce(&mut Post),
    {
        let (before, after) = store.update(id, change)?.ok_or(SyncError::NotFound(id))?;
        Ok(Self::pending(store, id, Some(before), Some(after)))
    }

    pub fn delete(store: &FeedStore, id: i64) -> SyncResult<Self> {
        let removed = store.remove(id)?.ok_or(SyncError::NotFound(id))?;
        Ok(Self::pending(store, id, Some(removed), None))
    }

    pub fn insert(store: &FeedStore, post: Post) -> SyncResult<Self> {
        if !store.swap_if(post.id, None, Some(&post))? {
            return Err(SyncError::Storage(format!("post {} already cached", post.id)));
        }
        Ok(Self::pending(store, post.id, None, Some(post)))
    }

    fn pending(store: &FeedStore, id: i64, before: Option<Post>, applied: Option<Post>) -> Self {
        Self {
            store: store.clone(),
            id,
            before,
            applied,
            settled: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn before(&self) -> Option<&Post> {
        self.before.as_ref()
    }

    pub fn applied(&self) -> Option<&Post> {
        self.applied.as_ref()
    }

    /// Keep the write. A `confirmed` row from the server replaces the local
    /// one, taking over its id when the server assigned a new one; `None`
    /// confirms a delete.
    ///
    /// The server's answer wins even when the row moved on locally in the
    /// meantime.
    pub fn commit(mut self, confirmed: Option<&Post>) -> SyncResult<()> {
        self.settled = true;
        if self.store.swap_if(self.id, self.applied.as_ref(), confirmed)? {
            return Ok(());
        }

        tracing::debug!("Post {} changed before confirmation; applying server state", self.id);
        match confirmed {
            Some(server) => {
                if server.id != self.id {
                    self.store.remove(self.id)?;
                }
                self.store.upsert(server)?;
            }
            None => {
                self.store.remove(self.id)?;
            }
        }
        Ok(())
    }

    /// Restore the row as it was before this write. Returns whether the
    /// restore happened.
    pub fn revert(mut self) -> SyncResult<bool> {
        self.settled = true;
        self.restore().map_err(SyncError::from)
    }

    fn restore(&self) -> Result<bool, crate::store::StoreError> {
        let restored = self
            .store
            .swap_if(self.id, self.applied.as_ref(), self.before.as_ref())?;
        if !restored {
            tracing::warn!("Post {} changed since optimistic write; not reverting", self.id);
        }
        Ok(restored)
    }
}

impl Drop for OptimisticWrite {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::info!("Optimistic write to post {} abandoned; reverting", self.id);
        if let Err(e) = self.restore() {
            tracing::error!("Failed to revert post {}: {}", self.id, e);
        }
    }
}

/// File to attach to a new post.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Bytes,
    pub filename: String,
}

/// Content of a post the user is about to publish.
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub content: String,
    pub attachment: Option<Upload>,
}

impl NewPost {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, bytes: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        self.attachment = Some(Upload {
            bytes: bytes.into(),
            filename: filename.into(),
        });
        self
    }
}

/// Runs user edits against the cache first and the backend second.
///
/// Each mutation holds the sync gate shared from its local write until it
/// settles, so page loads sharing the gate never interleave with it.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: FeedStore,
    remote: DynRemote,
    gate: SyncGate,
}

impl MutationCoordinator {
    pub fn new(store: FeedStore, remote: DynRemote) -> Self {
        Self::with_gate(store, remote, new_gate())
    }

    pub fn with_gate(store: FeedStore, remote: DynRemote, gate: SyncGate) -> Self {
        Self { store, remote, gate }
    }

    pub async fn like(&self, id: i64) -> SyncResult<Post> {
        let _gate = self.gate.read().await;
        let write = OptimisticWrite::update(&self.store, id, |post| {
            if !post.liked_by_me {
                post.liked_by_me = true;
                post.like_count += 1;
            }
        })?;

        match self.remote.like(id).await {
            Ok(server) => {
                write.commit(Some(&server))?;
                Ok(server)
            }
            Err(err) => Err(roll_back("like", write, err)),
        }
    }

    pub async fn unlike(&self, id: i64) -> SyncResult<Post> {
        let _gate = self.gate.read().await;
        let write = OptimisticWrite::update(&self.store, id, |post| {
            if post.liked_by_me {
                post.liked_by_me = false;
                post.like_count = post.like_count.saturating_sub(1);
            }
        })?;

        match self.remote.unlike(id).await {
            Ok(server) => {
                write.commit(Some(&server))?;
                Ok(server)
            }
            Err(err) => Err(roll_back("unlike", write, err)),
        }
    }

    pub async fn delete(&self, id: i64) -> SyncResult<()> {
        let _gate = self.gate.read().await;
        let write = OptimisticWrite::delete(&self.store, id)?;

        match self.remote.delete(id).await {
            Ok(()) => {
                write.commit(None)?;
                tracing::info!("Deleted post {}", id);
                Ok(())
            }
            Err(err) => Err(roll_back("delete", write, err)),
        }
    }

    /// Publish a new post. A placeholder with a negative id is shown until
    /// the server confirms; the attachment, if any, is uploaded first.
    pub async fn create(&self, draft: NewPost) -> SyncResult<Post> {
        let placeholder = Post {
            id: placeholder_id(),
            author_id: 0,
            author: String::new(),
            content: draft.content,
            published_at: now(),
            liked_by_me: false,
            like_count: 0,
            author_avatar: String::new(),
            attachment: None,
            owned_by_me: true,
        };
        let _gate = self.gate.read().await;
        let write = OptimisticWrite::insert(&self.store, placeholder.clone())?;
        let local_id = write.id();

        let attachment = match draft.attachment {
            Some(upload) => {
                match self
                    .remote
                    .upload_attachment(upload.bytes, &upload.filename)
                    .await
                {
                    Ok(media) => Some(Attachment {
                        url: media.id,
                        kind: AttachmentKind::Image,
                    }),
                    Err(err) => return Err(roll_back("upload", write, err)),
                }
            }
            None => None,
        };

        let request = Post {
            id: 0,
            attachment,
            ..placeholder
        };
        match self.remote.create(request).await {
            Ok(server) => {
                write.commit(Some(&server))?;
                tracing::info!("Published post {} (placeholder {})", server.id, local_id);
                Ok(server)
            }
            Err(err) => Err(roll_back("create", write, err)),
        }
    }

    /// Change the text of an existing post.
    pub async fn edit(&self, id: i64, content: String) -> SyncResult<Post> {
        let _gate = self.gate.read().await;
        let write = OptimisticWrite::update(&self.store, id, |post| post.content = content)?;
        let request = write.applied().cloned().ok_or(SyncError::NotFound(id))?;

        match self.remote.update(request).await {
            Ok(server) => {
                write.commit(Some(&server))?;
                Ok(server)
            }
            Err(err) => Err(roll_back("edit", write, err)),
        }
    }
}

fn roll_back(op: &str, write: OptimisticWrite, err: RemoteError) -> SyncError {
    tracing::warn!("Failed to {} post {}: {}; rolling back", op, write.id(), err);
    if let Err(store_err) = write.revert() {
        return store_err;
    }
    err.into()
}

fn placeholder_id() -> i64 {
    -rand::thread_rng().gen_range(1..i64::MAX)
}

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{post, FakeRemote};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(posts: Vec<Post>) -> (MutationCoordinator, Arc<FakeRemote>, FeedStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FeedStore::open(&temp_dir.path().join("feed.db")).unwrap();
        store.upsert_all(&posts).unwrap();
        let remote = Arc::new(FakeRemote::with_posts(posts));
        let coordinator = MutationCoordinator::new(store.clone(), remote.clone());
        (coordinator, remote, store, temp_dir)
    }

    fn conflict() -> RemoteError {
        RemoteError::Api {
            status: 409,
            message: "Conflict".into(),
        }
    }

    #[tokio::test]
    async fn test_like_commits_server_row() {
        let (coordinator, _remote, store, _temp) = setup(vec![post(7, 100)]);

        let server = coordinator.like(7).await.unwrap();
        assert!(server.liked_by_me);
        assert_eq!(server.like_count, 1);
        assert_eq!(store.get(7).unwrap(), Some(server));
    }

    #[tokio::test]
    async fn test_like_rejected_restores_pre_like_state() {
        let mut seeded = post(7, 100);
        seeded.like_count = 3;
        let (coordinator, remote, store, _temp) = setup(vec![seeded.clone()]);
        remote.fail("like", conflict());

        let err = coordinator.like(7).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Api {
                status: 409,
                message: "Conflict".into()
            }
        );
        assert_eq!(store.get(7).unwrap(), Some(seeded));
    }

    #[tokio::test]
    async fn test_unlike_rolls_back_on_network_failure() {
        let mut seeded = post(4, 100);
        seeded.liked_by_me = true;
        seeded.like_count = 1;
        let (coordinator, remote, store, _temp) = setup(vec![seeded.clone()]);
        remote.fail_all(RemoteError::Network("offline".into()));

        assert!(coordinator.unlike(4).await.is_err());
        assert_eq!(store.get(4).unwrap(), Some(seeded));
    }

    #[tokio::test]
    async fn test_like_uncached_post_is_not_found() {
        let (coordinator, remote, _store, _temp) = setup(vec![]);
        assert_eq!(coordinator.like(99).await.unwrap_err(), SyncError::NotFound(99));
        assert_eq!(remote.calls("like"), 0);
    }

    #[tokio::test]
    async fn test_delete_failure_reinserts_full_row() {
        let mut seeded = post(5, 100);
        seeded.like_count = 12;
        seeded.liked_by_me = true;
        seeded.attachment = Some(Attachment {
            url: "cat.png".into(),
            kind: AttachmentKind::Image,
        });
        let (coordinator, remote, store, _temp) = setup(vec![seeded.clone()]);
        remote.fail("delete", RemoteError::Network("reset".into()));

        assert!(coordinator.delete(5).await.is_err());
        assert_eq!(store.get(5).unwrap(), Some(seeded));
    }

    #[tokio::test]
    async fn test_delete_success_removes_row() {
        let (coordinator, remote, store, _temp) = setup(vec![post(5, 100), post(6, 200)]);

        coordinator.delete(5).await.unwrap();
        assert_eq!(store.get(5).unwrap(), None);
        assert_eq!(remote.server_post(5), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_placeholder_with_server_post() {
        let (coordinator, remote, store, _temp) = setup(vec![post(1, 100)]);

        let created = coordinator.create(NewPost::text("hello")).await.unwrap();
        assert_eq!(created.id, 2);
        assert_eq!(created.content, "hello");
        assert_eq!(remote.requests().last().map(String::as_str), Some("save:0"));

        let cached = store.all().unwrap();
        assert_eq!(cached.len(), 2);
        assert!(cached.iter().all(|p| !p.is_placeholder()));
        assert_eq!(store.get(2).unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_create_uploads_attachment_first() {
        let (coordinator, remote, _store, _temp) = setup(vec![]);

        let draft = NewPost::text("with photo").with_attachment(vec![1u8, 2, 3], "photo.jpg");
        let created = coordinator.create(draft).await.unwrap();
        assert_eq!(
            created.attachment,
            Some(Attachment {
                url: "media-1-photo.jpg".into(),
                kind: AttachmentKind::Image,
            })
        );
        assert_eq!(remote.requests(), vec!["upload:photo.jpg:3", "save:0"]);
    }

    #[tokio::test]
    async fn test_failed_upload_drops_placeholder_without_saving() {
        let (coordinator, remote, store, _temp) = setup(vec![post(1, 100)]);
        remote.fail("upload", RemoteError::Api {
            status: 413,
            message: "Payload Too Large".into(),
        });

        let draft = NewPost::text("big").with_attachment(vec![0u8; 16], "big.png");
        assert!(coordinator.create(draft).await.is_err());
        assert_eq!(remote.calls("save"), 0);
        assert_eq!(store.all().unwrap(), vec![post(1, 100)]);
    }

    #[tokio::test]
    async fn test_failed_create_drops_placeholder() {
        let (coordinator, remote, store, _temp) = setup(vec![]);
        remote.fail("save", RemoteError::Network("offline".into()));

        assert!(coordinator.create(NewPost::text("lost")).await.is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_placeholder_visible_while_create_in_flight() {
        let (coordinator, remote, store, _temp) = setup(vec![]);
        remote.set_latency(Duration::from_millis(200));

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.create(NewPost::text("pending")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cached = store.all().unwrap();
        assert_eq!(cached.len(), 1);
        assert!(cached[0].is_placeholder());
        assert_eq!(cached[0].content, "pending");

        let created = task.await.unwrap().unwrap();
        assert_eq!(store.all().unwrap(), vec![created]);
    }

    #[tokio::test]
    async fn test_edit_saves_new_content() {
        let (coordinator, remote, store, _temp) = setup(vec![post(3, 100)]);

        let saved = coordinator.edit(3, "edited".into()).await.unwrap();
        assert_eq!(saved.content, "edited");
        assert_eq!(store.get(3).unwrap().unwrap().content, "edited");
        assert_eq!(remote.server_post(3).unwrap().content, "edited");
    }

    #[tokio::test]
    async fn test_revert_skipped_when_row_changed_again() {
        let (_coordinator, _remote, store, _temp) = setup(vec![post(8, 100)]);

        let write = OptimisticWrite::update(&store, 8, |p| p.like_count = 1).unwrap();
        store.update(8, |p| p.like_count = 2).unwrap();

        assert!(!write.revert().unwrap());
        assert_eq!(store.get(8).unwrap().unwrap().like_count, 2);
    }

    #[tokio::test]
    async fn test_dropped_write_reverts() {
        let (_coordinator, _remote, store, _temp) = setup(vec![post(8, 100)]);

        {
            let _write = OptimisticWrite::delete(&store, 8).unwrap();
            assert_eq!(store.get(8).unwrap(), None);
        }
        assert_eq!(store.get(8).unwrap(), Some(post(8, 100)));
    }
    #[tokio::test]
    async fn test_edit_failure_restores_content() {
        let (coordinator, remote, store, _temp) = setup(vec![post(3, 100)]);
        remote.fail("save", conflict());

        let err = coordinator.edit(3, "rewritten".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::Api { status: 409, .. }));
        assert_eq!(store.get(3).unwrap(), Some(post(3, 100)));
        assert_eq!(remote.server_post(3).unwrap().content, "post 3");
    }

    #[tokio::test]
    async fn test_undecodable_response_rolls_back_as_unknown() {
        let mut seeded = post(6, 100);
        seeded.liked_by_me = true;
        seeded.like_count = 4;
        let (coordinator, remote, store, _temp) = setup(vec![seeded.clone()]);
        remote.fail("unlike", RemoteError::Unknown("expected value at line 1".into()));

        let err = coordinator.unlike(6).await.unwrap_err();
        assert_eq!(err, SyncError::Unknown("expected value at line 1".into()));
        assert!(!err.is_retryable());
        assert_eq!(store.get(6).unwrap(), Some(seeded));

        remote.fail("delete", RemoteError::Unknown("garbage".into()));
        assert_eq!(
            coordinator.delete(6).await.unwrap_err(),
            SyncError::Unknown("garbage".into())
        );
        assert_eq!(store.get(6).unwrap().map(|p| p.like_count), Some(4));
    }

    #[tokio::test]
    async fn test_commit_applies_server_row_after_local_replace() {
        let (_coordinator, _remote, store, _temp) = setup(vec![post(8, 100)]);

        let write = OptimisticWrite::update(&store, 8, |p| {
            p.liked_by_me = true;
            p.like_count = 1;
        })
        .unwrap();
        // The row is overwritten with a stale copy before the server answers.
        store.upsert(&post(8, 100)).unwrap();

        let mut server = post(8, 100);
        server.liked_by_me = true;
        server.like_count = 1;
        write.commit(Some(&server)).unwrap();
        assert_eq!(store.get(8).unwrap(), Some(server));
    }

    #[tokio::test]
    async fn test_commit_of_delete_removes_reinserted_row() {
        let (_coordinator, _remote, store, _temp) = setup(vec![post(8, 100), post(9, 200)]);

        let write = OptimisticWrite::delete(&store, 8).unwrap();
        store.upsert(&post(8, 100)).unwrap();

        write.commit(None).unwrap();
        assert_eq!(store.get(8).unwrap(), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mutation_holds_the_gate_until_settled() {
        let (coordinator, remote, store, _temp) = setup(vec![post(7, 100)]);
        remote.delay("like", Duration::from_millis(150));
        let gate = coordinator.gate.clone();

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.like(7).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gate.try_write().is_err());

        let exclusive = gate.write().await;
        assert!(store.get(7).unwrap().unwrap().liked_by_me);
        drop(exclusive);
        assert!(task.await.unwrap().is_ok());
    }
}
