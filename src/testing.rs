//! In-memory backend and fixtures for exercising the sync core without a
//! network.
//!
//! `FakeRemote` behaves like the real backend: ids are assigned in
//! publication order, list endpoints answer newest first, and any endpoint
//! can be made to fail on demand.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::db::models::{MediaRef, Post};
use crate::remote::{RemoteError, RemoteResult, RemoteSource};

/// A post by "Netology" published `published_secs` after the epoch.
pub fn post(id: i64, published_secs: i64) -> Post {
    Post {
        id,
        author_id: 1,
        author: "Netology".to_string(),
        content: format!("post {id}"),
        published_at: DateTime::from_timestamp(published_secs, 0).unwrap_or_default(),
        liked_by_me: false,
        like_count: 0,
        author_avatar: "netology.jpg".to_string(),
        attachment: None,
        owned_by_me: false,
    }
}

/// Posts `1..=count`, one minute apart, id order matching publication order.
pub fn timeline(count: i64) -> Vec<Post> {
    (1..=count).map(|id| post(id, 1_700_000_000 + id * 60)).collect()
}

/// Noon of `date` at `offset`, as UTC; far from either day boundary.
pub fn noon_on(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_hms_opt(12, 0, 0).unwrap_or_default();
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
        - chrono::Duration::seconds(i64::from(offset.local_minus_utc()))
}

#[derive(Default)]
struct FakeState {
    posts: BTreeMap<i64, Post>,
    failures: HashMap<&'static str, RemoteError>,
    outage: Option<RemoteError>,
    requests: Vec<String>,
    latency: Duration,
    delays: HashMap<&'static str, Duration>,
    uploads: usize,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_posts(posts: impl IntoIterator<Item = Post>) -> Self {
        let remote = Self::new();
        remote.publish(posts);
        remote
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or overwrite) posts on the server side.
    pub fn publish(&self, posts: impl IntoIterator<Item = Post>) {
        let mut state = self.state();
        for post in posts {
            state.posts.insert(post.id, post);
        }
    }

    pub fn server_post(&self, id: i64) -> Option<Post> {
        self.state().posts.get(&id).cloned()
    }

    /// Make every call to `op` fail with `err` until `recover`.
    pub fn fail(&self, op: &'static str, err: RemoteError) {
        self.state().failures.insert(op, err);
    }

    /// Make every call fail with `err` until `recover`.
    pub fn fail_all(&self, err: RemoteError) {
        self.state().outage = Some(err);
    }

    pub fn recover(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.outage = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Slow down `op` alone, on top of the shared latency.
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// Every request seen so far, as `op` or `op:args`.
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    /// Number of requests made to `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.split(':').next() == Some(op))
            .count()
    }

    async fn begin(&self, op: &'static str, request: String) -> RemoteResult<()> {
        let (latency, failure) = {
            let mut state = self.state();
            state.requests.push(request);
            let failure = state
                .outage
                .clone()
                .or_else(|| state.failures.get(op).cloned());
            let delay = state.delays.get(op).copied().unwrap_or_default();
            (state.latency + delay, failure)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn newest_first(&self, filter: impl Fn(i64) -> bool) -> Vec<Post> {
        self.state()
            .posts
            .values()
            .rev()
            .filter(|p| filter(p.id))
            .cloned()
            .collect()
    }

    fn modify(&self, id: i64, change: impl FnOnce(&mut Post)) -> RemoteResult<Post> {
        let mut state = self.state();
        let post = state.posts.get_mut(&id).ok_or_else(|| RemoteError::Api {
            status: 404,
            message: "Not Found".to_string(),
        })?;
        change(post);
        Ok(post.clone())
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_all(&self) -> RemoteResult<Vec<Post>> {
        self.begin("all", "all".to_string()).await?;
        Ok(self.newest_first(|_| true))
    }

    async fn fetch_latest(&self, count: usize) -> RemoteResult<Vec<Post>> {
        self.begin("latest", format!("latest:{count}")).await?;
        Ok(self.newest_first(|_| true).into_iter().take(count).collect())
    }

    async fn fetch_before(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>> {
        self.begin("before", format!("before:{id}:{count}")).await?;
        Ok(self
            .newest_first(|other| other < id)
            .into_iter()
            .take(count)
            .collect())
    }

    async fn fetch_after(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>> {
        self.begin("after", format!("after:{id}:{count}")).await?;
        let mut newer = self.newest_first(|other| other > id);
        // Closest to the anchor first, then back to newest-first order.
        newer.reverse();
        newer.truncate(count);
        newer.reverse();
        Ok(newer)
    }

    async fn fetch_newer(&self, id: i64) -> RemoteResult<Vec<Post>> {
        self.begin("newer", format!("newer:{id}")).await?;
        Ok(self.newest_first(|other| other > id))
    }

    async fn create(&self, post: Post) -> RemoteResult<Post> {
        self.begin("save", format!("save:{}", post.id)).await?;
        let mut state = self.state();
        if post.id > 0 {
            let saved = state.posts.get_mut(&post.id).ok_or_else(|| RemoteError::Api {
                status: 404,
                message: "Not Found".to_string(),
            })?;
            saved.content = post.content;
            saved.attachment = post.attachment;
            return Ok(saved.clone());
        }

        let id = state.posts.keys().next_back().copied().unwrap_or(0) + 1;
        let published_at = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default();
        let created = Post {
            id,
            published_at,
            owned_by_me: true,
            like_count: 0,
            liked_by_me: false,
            ..post
        };
        state.posts.insert(id, created.clone());
        Ok(created)
    }

    async fn delete(&self, id: i64) -> RemoteResult<()> {
        self.begin("delete", format!("delete:{id}")).await?;
        self.state().posts.remove(&id);
        Ok(())
    }

    async fn like(&self, id: i64) -> RemoteResult<Post> {
        self.begin("like", format!("like:{id}")).await?;
        self.modify(id, |p| {
            if !p.liked_by_me {
                p.liked_by_me = true;
                p.like_count += 1;
            }
        })
    }

    async fn unlike(&self, id: i64) -> RemoteResult<Post> {
        self.begin("unlike", format!("unlike:{id}")).await?;
        self.modify(id, |p| {
            if p.liked_by_me {
                p.liked_by_me = false;
                p.like_count = p.like_count.saturating_sub(1);
            }
        })
    }

    async fn upload_attachment(&self, bytes: Bytes, filename: &str) -> RemoteResult<MediaRef> {
        self.begin("upload", format!("upload:{filename}:{}", bytes.len()))
            .await?;
        let mut state = self.state();
        state.uploads += 1;
        Ok(MediaRef {
            id: format!("media-{}-{}", state.uploads, filename),
        })
    }
}
