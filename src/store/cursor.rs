use std::collections::VecDeque;

use super::{FeedStore, StoreResult};
use crate::db::models::Post;

/// Lazy, forward-only walk over the cache in canonical order.
///
/// Rows are fetched `chunk` at a time by keyset, so the cursor can run over
/// a feed of any length. It cannot be rewound; start a new cursor to
/// re-read from the top.
pub struct PostCursor {
    store: FeedStore,
    chunk: usize,
    after: Option<(i64, i64)>,
    buffered: VecDeque<Post>,
    exhausted: bool,
}

impl PostCursor {
    pub(super) fn new(store: FeedStore, chunk: usize) -> Self {
        Self {
            store,
            chunk: chunk.max(1),
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> StoreResult<()> {
        let page = self.store.page_after(self.after, self.chunk)?;
        if page.len() < self.chunk {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.order_key());
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for PostCursor {
    type Item = StoreResult<Post>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::FeedStore;
    use crate::testing::post;
    use tempfile::TempDir;

    #[test]
    fn cursor_yields_everything_across_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = FeedStore::open(&temp_dir.path().join("feed.db")).unwrap();
        let posts: Vec<_> = (1..=7).map(|id| post(id, id * 60)).collect();
        store.upsert_all(&posts).unwrap();

        let ids: Vec<i64> = store
            .cursor(3)
            .map(|p| p.unwrap().id)
            .collect();
        assert_eq!(ids, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn cursor_over_empty_store_ends_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let store = FeedStore::open(&temp_dir.path().join("feed.db")).unwrap();
        assert_eq!(store.cursor(10).count(), 0);
    }
}
