//! Display projection of the cached feed.
//!
//! The projector decorates the canonical post sequence with date separators
//! and filler items. Neither decoration is ever persisted: the only way back
//! from a [`FeedItem`] to storable data is [`FeedItem::into_post`].

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use std::collections::VecDeque;

use crate::db::models::Post;

/// Relative age bucket a separator announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DateBucket {
    Today,
    Yesterday,
    ThisWeek,
    WeekAgo,
}

impl DateBucket {
    /// Stable id of the separator for this bucket.
    pub fn ordinal(&self) -> i64 {
        match self {
            DateBucket::Today => 0,
            DateBucket::Yesterday => 1,
            DateBucket::ThisWeek => 2,
            DateBucket::WeekAgo => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DateBucket::Today => "Today",
            DateBucket::Yesterday => "Yesterday",
            DateBucket::ThisWeek => "This week",
            DateBucket::WeekAgo => "More than a week ago",
        }
    }
}

/// One row of the displayed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Post(Post),
    DateSeparator { bucket: DateBucket },
    Filler { id: i64, payload_ref: String },
}

/// Identity of a displayed row: variant plus id.
///
/// Two separators for the same bucket are the same row across refreshes;
/// two posts with identical fields but different ids are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Post(i64),
    DateSeparator(i64),
    Filler(i64),
}

impl FeedItem {
    pub fn key(&self) -> ItemKey {
        match self {
            FeedItem::Post(post) => ItemKey::Post(post.id),
            FeedItem::DateSeparator { bucket } => ItemKey::DateSeparator(bucket.ordinal()),
            FeedItem::Filler { id, .. } => ItemKey::Filler(*id),
        }
    }

    pub fn id(&self) -> i64 {
        match self.key() {
            ItemKey::Post(id) | ItemKey::DateSeparator(id) | ItemKey::Filler(id) => id,
        }
    }

    /// Whether `self` and `other` denote the same displayed row.
    pub fn same_item(&self, other: &FeedItem) -> bool {
        self.key() == other.key()
    }

    /// Whether the two rows may be drawn identically.
    pub fn same_content(&self, other: &FeedItem) -> bool {
        self == other
    }

    /// The only path from a display row to storage; synthetic rows yield
    /// `None`.
    pub fn into_post(self) -> Option<Post> {
        match self {
            FeedItem::Post(post) => Some(post),
            FeedItem::DateSeparator { .. } | FeedItem::Filler { .. } => None,
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            FeedItem::Post(post) => Some(post),
            FeedItem::DateSeparator { .. } | FeedItem::Filler { .. } => None,
        }
    }
}

/// Where a projected window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// At the true top of the feed; a leading separator is emitted.
    Complete,
    /// Mid-feed. `offset` persisted posts precede the window, which keeps
    /// the filler stride aligned. No leading separator.
    Partial { offset: usize },
}

#[derive(Debug, Clone)]
pub struct FillerConfig {
    /// Emit a filler after every `stride` posts; `0` disables fillers.
    pub stride: usize,
    pub payload_ref: String,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            stride: 5,
            payload_ref: "promo.jpg".to_string(),
        }
    }
}

/// Zone whose calendar days the buckets count.
#[derive(Debug, Clone, Copy)]
enum Zone {
    Fixed(FixedOffset),
    /// The system zone, with its daylight-saving rules applied per post.
    Local,
}

impl Zone {
    fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Zone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            Zone::Local => instant.with_timezone(&Local).date_naive(),
        }
    }
}

/// Bucket boundaries are fixed when the projector is built.
#[derive(Debug, Clone)]
pub struct Projector {
    today: NaiveDate,
    zone: Zone,
    filler: FillerConfig,
}

impl Projector {
    pub fn new(today: NaiveDate, offset: FixedOffset, filler: FillerConfig) -> Self {
        Self {
            today,
            zone: Zone::Fixed(offset),
            filler,
        }
    }

    /// Projector anchored at the current local date.
    pub fn local(filler: FillerConfig) -> Self {
        Self {
            today: Local::now().date_naive(),
            zone: Zone::Local,
            filler,
        }
    }

    pub fn bucket(&self, published_at: DateTime<Utc>) -> Option<DateBucket> {
        let date = self.zone.date_of(published_at);
        let days_ago = (self.today - date).num_days();
        match days_ago {
            0 => Some(DateBucket::Today),
            1 => Some(DateBucket::Yesterday),
            2..=6 => Some(DateBucket::ThisWeek),
            d if d >= 7 => Some(DateBucket::WeekAgo),
            // Published "in the future" relative to the captured date
            _ => None,
        }
    }

    /// Lazily decorate `posts`, which must already be in canonical order.
    pub fn project<I, E>(&self, posts: I, boundary: Boundary) -> Projection<I::IntoIter>
    where
        I: IntoIterator<Item = Result<Post, E>>,
    {
        let (seen, leading) = match boundary {
            Boundary::Complete => (0, true),
            Boundary::Partial { offset } => (offset, false),
        };
        Projection {
            projector: self.clone(),
            posts: posts.into_iter(),
            pending: VecDeque::new(),
            previous: None,
            started: false,
            leading_separator: leading,
            seen,
        }
    }

    /// Eager projection of an in-memory slice.
    pub fn project_all(&self, posts: &[Post], boundary: Boundary) -> Vec<FeedItem> {
        self.project(
            posts.iter().cloned().map(Ok::<_, std::convert::Infallible>),
            boundary,
        )
        .filter_map(Result::ok)
        .collect()
    }

    fn filler(&self) -> FeedItem {
        FeedItem::Filler {
            id: rand::random(),
            payload_ref: self.filler.payload_ref.clone(),
        }
    }
}

/// Iterator returned by [`Projector::project`].
pub struct Projection<I> {
    projector: Projector,
    posts: I,
    pending: VecDeque<FeedItem>,
    previous: Option<DateBucket>,
    started: bool,
    leading_separator: bool,
    seen: usize,
}

impl<I, E> Iterator for Projection<I>
where
    I: Iterator<Item = Result<Post, E>>,
{
    type Item = Result<FeedItem, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.pending.pop_front() {
            return Some(Ok(item));
        }

        let post = match self.posts.next()? {
            Ok(post) => post,
            Err(e) => return Some(Err(e)),
        };

        let bucket = self.projector.bucket(post.published_at);
        let separator_allowed = self.started || self.leading_separator;
        if let Some(current) = bucket {
            if separator_allowed && bucket != self.previous {
                self.pending
                    .push_back(FeedItem::DateSeparator { bucket: current });
            }
        }
        self.started = true;
        self.previous = bucket;

        self.pending.push_back(FeedItem::Post(post));
        self.seen += 1;

        let stride = self.projector.filler.stride;
        if stride > 0 && self.seen % stride == 0 {
            self.pending.push_back(self.projector.filler());
        }

        self.pending.pop_front().map(Ok)
    }
}
