//! Resolution of identifiers into the post entries they stand for.
//!
//! Direct post ids are a single entry. Pools are one request returning their post ids in pool order.
//! Artist tag queries page through the post search with `b<id>` / `a<id>` cursors; search results
//! already carry full post payloads, so those entries are kept inline instead of being fetched again.
//! Listing order is always preserved as returned.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::danbooru::classifier::{ClassifiedOutcome, classify, classify_transport_error};
use crate::danbooru::identifier::Identifier;
use crate::danbooru::sender::{Credential, Transport, TransportError};

/// Pivots above this make the server overflow its integer column.
pub const MAX_PIVOT: u64 = 10_000_000;

/// Upper bound the post search accepts for `limit`.
pub const MAX_POSTS_PER_PAGE: usize = 200;

/// One unit of work produced by a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum ListingEntry {
    /// Needs a `posts/<id>.json` request.
    Post(u64),
    /// Like `Post`, with the 1-based position the post holds in its pool.
    Page { post_id: u64, page: usize },
    /// Payload already delivered by the listing. Gated entries have no id.
    Inline { post_id: Option<u64>, body: Value },
}

impl ListingEntry {
    pub fn post_id(&self) -> Option<u64> {
        match self {
            ListingEntry::Post(id) | ListingEntry::Page { post_id: id, .. } => Some(*id),
            ListingEntry::Inline { post_id, .. } => *post_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Lower ids, or earlier pool entries.
    #[default]
    Before,
    /// Higher ids, or later pool entries.
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Slice by position in the pool. Files are named after their page.
    #[default]
    Order,
    /// Filter by post id relative to the pivot. Files are named after their post.
    Id,
}

/// Which part of a pool to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolRange {
    pub mode: PoolMode,
    pub direction: Direction,
    pub pivot: u64,
    pub limit: Option<usize>,
}

impl Default for PoolRange {
    fn default() -> Self {
        Self {
            mode: PoolMode::Order,
            direction: Direction::After,
            pivot: 0,
            limit: None,
        }
    }
}

/// Listing section of `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingOptions {
    pub posts_per_page: usize,
    pub max_pages: usize,
    /// Total posts taken from one artist query.
    pub artist_limit: Option<usize>,
    pub artist_direction: Direction,
    pub artist_pivot: Option<u64>,
    pub pool: PoolRange,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            posts_per_page: MAX_POSTS_PER_PAGE,
            max_pages: 50,
            artist_limit: None,
            artist_direction: Direction::Before,
            artist_pivot: None,
            pool: PoolRange::default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ListingError {
    /// The listing request itself did not succeed.
    #[error("Listing request failed: {}", .0.kind())]
    Request(ClassifiedOutcome),

    #[error("Listing payload has an unexpected shape: {0}")]
    Shape(String),
}

#[derive(Debug, Deserialize)]
struct PoolEntry {
    name: Option<String>,
    post_ids: Vec<u64>,
}

/// Applies a pool range without ever reordering the pool.
///
/// Each selected post comes with its 1-based page in the pool.
pub fn select_pool_posts(post_ids: &[u64], range: &PoolRange) -> Vec<(usize, u64)> {
    let limit = range.limit.unwrap_or(usize::MAX);
    let pages: Vec<(usize, u64)> = post_ids.iter().enumerate().map(|(index, id)| (index + 1, *id)).collect();
    match (range.mode, range.direction) {
        (PoolMode::Order, Direction::After) => {
            let start = usize::try_from(range.pivot).unwrap_or(usize::MAX).min(pages.len());
            pages[start..].iter().take(limit).copied().collect()
        }
        (PoolMode::Order, Direction::Before) => {
            let end = usize::try_from(range.pivot).unwrap_or(usize::MAX).min(pages.len());
            let start = end.saturating_sub(limit);
            pages[start..end].to_vec()
        }
        (PoolMode::Id, Direction::After) => pages
            .into_iter()
            .filter(|(_, id)| *id > range.pivot)
            .take(limit)
            .collect(),
        (PoolMode::Id, Direction::Before) => {
            let matching: Vec<(usize, u64)> = pages.into_iter().filter(|(_, id)| *id < range.pivot).collect();
            let skip = matching.len().saturating_sub(limit);
            matching[skip..].to_vec()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Start,
    /// `page` is `None` for the first unpivoted artist page.
    Next { page: Option<String>, taken: usize, pages: usize },
    Done,
}

/// Lazy page sequence for one identifier.
///
/// A page whose request fails leaves the cursor where it was, so calling
/// [`next_page`](Self::next_page) again asks for the same page.
#[derive(Debug, Clone)]
pub struct ListingCursor {
    identifier: Identifier,
    options: ListingOptions,
    state: CursorState,
    title: Option<String>,
    request_timeout: Option<Duration>,
}

impl ListingCursor {
    pub fn new(identifier: Identifier, options: ListingOptions) -> Self {
        Self {
            identifier,
            options,
            state: CursorState::Start,
            title: None,
            request_timeout: None,
        }
    }

    /// Bounds every listing request the same way post requests are bounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Pool name with underscores as spaces, once the pool has been fetched.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Fetches the next page of entries. `Ok(None)` once the listing is exhausted.
    pub async fn next_page(
        &mut self,
        transport: &dyn Transport,
        credential: &Credential,
    ) -> Result<Option<Vec<ListingEntry>>, ListingError> {
        match (self.identifier.clone(), self.state.clone()) {
            (_, CursorState::Done) => Ok(None),
            (Identifier::Post(id), _) => {
                self.state = CursorState::Done;
                Ok(Some(vec![ListingEntry::Post(id)]))
            }
            (Identifier::Pool(pool_id), _) => self.fetch_pool(pool_id, transport, credential).await.map(Some),
            (Identifier::Artist(_), CursorState::Start) => {
                let page = self.first_artist_page();
                self.fetch_artist_page(page, 0, 0, transport, credential).await
            }
            (Identifier::Artist(_), CursorState::Next { page, taken, pages }) => {
                self.fetch_artist_page(page, taken, pages, transport, credential).await
            }
        }
    }

    async fn get_json(
        &self,
        path: &str,
        transport: &dyn Transport,
        credential: &Credential,
    ) -> Result<Value, ListingError> {
        let response = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, transport.get(path, credential))
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => transport.get(path, credential).await,
        };
        let classified = match response {
            Ok(response) => classify(&response),
            Err(error) => classify_transport_error(&error),
        };
        match classified {
            ClassifiedOutcome::Success(body) => Ok(body),
            other => Err(ListingError::Request(other)),
        }
    }

    async fn fetch_pool(
        &mut self,
        pool_id: u64,
        transport: &dyn Transport,
        credential: &Credential,
    ) -> Result<Vec<ListingEntry>, ListingError> {
        let body = self
            .get_json(&format!("pools/{}.json", pool_id), transport, credential)
            .await?;
        self.state = CursorState::Done;
        let pool: PoolEntry =
            serde_json::from_value(body).map_err(|e| ListingError::Shape(e.to_string()))?;

        self.title = pool
            .name
            .map(|name| name.replace('_', " ").trim().to_string())
            .filter(|name| !name.is_empty());
        let selected = select_pool_posts(&pool.post_ids, &self.options.pool);
        info!(
            pool_id,
            total = pool.post_ids.len(),
            selected = selected.len(),
            "Resolved pool listing"
        );

        let mode = self.options.pool.mode;
        Ok(selected
            .into_iter()
            .map(|(page, post_id)| match mode {
                PoolMode::Order => ListingEntry::Page { post_id, page },
                PoolMode::Id => ListingEntry::Post(post_id),
            })
            .collect())
    }

    fn first_artist_page(&self) -> Option<String> {
        let marker = match self.options.artist_direction {
            Direction::Before => 'b',
            Direction::After => 'a',
        };
        match (self.options.artist_pivot, self.options.artist_direction) {
            (Some(pivot), _) => Some(format!("{}{}", marker, pivot.min(MAX_PIVOT))),
            (None, Direction::Before) => None,
            (None, Direction::After) => Some("a0".to_string()),
        }
    }

    async fn fetch_artist_page(
        &mut self,
        page: Option<String>,
        taken: usize,
        pages: usize,
        transport: &dyn Transport,
        credential: &Credential,
    ) -> Result<Option<Vec<ListingEntry>>, ListingError> {
        let Identifier::Artist(tag) = self.identifier.clone() else {
            return Ok(None);
        };

        let total_limit = self.options.artist_limit.unwrap_or(usize::MAX);
        let per_page = self.options.posts_per_page.clamp(1, MAX_POSTS_PER_PAGE);
        let request_limit = per_page.min(total_limit.saturating_sub(taken));
        if request_limit == 0 || pages >= self.options.max_pages {
            self.state = CursorState::Done;
            return Ok(None);
        }

        let mut path = format!(
            "posts.json?tags={}&limit={}",
            urlencoding::encode(&tag),
            request_limit
        );
        if let Some(page) = &page {
            path.push_str("&page=");
            path.push_str(page);
        }

        let body = self.get_json(&path, transport, credential).await?;
        let Value::Array(posts) = body else {
            self.state = CursorState::Done;
            return Err(ListingError::Shape("post search did not return an array".to_string()));
        };

        let fetched = posts.len();
        let entries: Vec<ListingEntry> = posts
            .into_iter()
            .map(|body| ListingEntry::Inline {
                post_id: body.get("id").and_then(Value::as_u64),
                body,
            })
            .collect();
        debug!(artist = %tag, page = ?page, fetched, "Fetched artist page");

        let ids = entries.iter().filter_map(ListingEntry::post_id);
        let next_pivot = match self.options.artist_direction {
            Direction::Before => ids.min(),
            Direction::After => ids.max(),
        };
        let taken = taken + fetched;

        self.state = match next_pivot {
            _ if fetched < request_limit => CursorState::Done,
            None => {
                warn!(artist = %tag, "Page carried no visible post ids, cannot paginate further");
                CursorState::Done
            }
            Some(pivot) => {
                let marker = match self.options.artist_direction {
                    Direction::Before => 'b',
                    Direction::After => 'a',
                };
                CursorState::Next {
                    page: Some(format!("{}{}", marker, pivot)),
                    taken,
                    pages: pages + 1,
                }
            }
        };

        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entries))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danbooru::classifier::{ServerErrorCause, ServerFault};
    use crate::danbooru::sender::RawResponse;
    use crate::danbooru::test_support::ScriptedTransport;
    use serde_json::json;

    async fn drain(cursor: &mut ListingCursor, transport: &ScriptedTransport) -> Result<Vec<ListingEntry>, ListingError> {
        let mut entries = Vec::new();
        while let Some(page) = cursor.next_page(transport, &Credential::Anonymous).await? {
            entries.extend(page);
        }
        Ok(entries)
    }

    fn ids(selected: Vec<(usize, u64)>) -> Vec<u64> {
        selected.into_iter().map(|(_, id)| id).collect()
    }

    #[test]
    fn test_pool_order_range() {
        let pool = [30, 10, 20, 50, 40];
        let all = PoolRange::default();
        assert_eq!(ids(select_pool_posts(&pool, &all)), vec![30, 10, 20, 50, 40]);

        let after = PoolRange { pivot: 1, limit: Some(2), ..PoolRange::default() };
        assert_eq!(select_pool_posts(&pool, &after), vec![(2, 10), (3, 20)]);

        let before = PoolRange {
            direction: Direction::Before,
            pivot: 4,
            limit: Some(3),
            ..PoolRange::default()
        };
        assert_eq!(select_pool_posts(&pool, &before), vec![(2, 10), (3, 20), (4, 50)]);
    }

    #[test]
    fn test_pool_id_range_keeps_listing_order() {
        let pool = [30, 10, 20, 50, 40];
        let after = PoolRange {
            mode: PoolMode::Id,
            direction: Direction::After,
            pivot: 15,
            limit: Some(3),
        };
        assert_eq!(ids(select_pool_posts(&pool, &after)), vec![30, 20, 50]);

        let before = PoolRange {
            mode: PoolMode::Id,
            direction: Direction::Before,
            pivot: 35,
            limit: Some(2),
        };
        assert_eq!(ids(select_pool_posts(&pool, &before)), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_pool_listing_preserves_unsorted_order() {
        let transport = ScriptedTransport::new().respond(
            "pools/9.json",
            RawResponse::new(200, r#"{"id": 9, "name": "summer_set", "post_ids": [500, 120, 900, 3]}"#),
        );
        let mut cursor = ListingCursor::new(Identifier::Pool(9), ListingOptions::default());

        let entries = drain(&mut cursor, &transport).await.expect("entries");
        let ids: Vec<u64> = entries.iter().filter_map(ListingEntry::post_id).collect();
        assert_eq!(ids, vec![500, 120, 900, 3]);
        assert_eq!(entries[1], ListingEntry::Page { post_id: 120, page: 2 });
        assert_eq!(cursor.title(), Some("summer set"));
    }

    #[tokio::test]
    async fn test_pool_id_mode_has_no_pages() {
        let transport = ScriptedTransport::new().respond(
            "pools/2.json",
            RawResponse::new(200, r#"{"id": 2, "name": "x", "post_ids": [7, 8]}"#),
        );
        let options = ListingOptions {
            pool: PoolRange { mode: PoolMode::Id, ..PoolRange::default() },
            ..ListingOptions::default()
        };
        let mut cursor = ListingCursor::new(Identifier::Pool(2), options);

        let entries = drain(&mut cursor, &transport).await.expect("entries");
        assert_eq!(entries, vec![ListingEntry::Post(7), ListingEntry::Post(8)]);
    }

    #[tokio::test]
    async fn test_failed_pool_request_can_be_repeated() {
        let transport = ScriptedTransport::new()
            .respond("pools/4.json", RawResponse::new(503, "busy"))
            .respond("pools/4.json", RawResponse::new(200, r#"{"id": 4, "post_ids": [1]}"#));
        let mut cursor = ListingCursor::new(Identifier::Pool(4), ListingOptions::default());

        let first = cursor.next_page(&transport, &Credential::Anonymous).await;
        assert!(matches!(first, Err(ListingError::Request(ClassifiedOutcome::ServerError(_)))));

        let entries = drain(&mut cursor, &transport).await.expect("entries");
        assert_eq!(entries, vec![ListingEntry::Page { post_id: 1, page: 1 }]);
        assert_eq!(cursor.title(), None);
    }

    #[tokio::test]
    async fn test_hanging_listing_times_out() {
        let transport = ScriptedTransport::new().hang("pools/6.json");
        let mut cursor = ListingCursor::new(Identifier::Pool(6), ListingOptions::default())
            .with_timeout(std::time::Duration::from_millis(30));

        let result = cursor.next_page(&transport, &Credential::Anonymous).await;
        assert!(matches!(
            result,
            Err(ListingError::Request(ClassifiedOutcome::ServerError(ServerFault {
                cause: ServerErrorCause::Timeout,
                ..
            })))
        ));
    }

    #[tokio::test]
    async fn test_missing_pool_is_request_error() {
        let transport = ScriptedTransport::new();
        let mut cursor = ListingCursor::new(Identifier::Pool(1), ListingOptions::default());
        let result = cursor.next_page(&transport, &Credential::Anonymous).await;
        assert_eq!(result, Err(ListingError::Request(ClassifiedOutcome::NotFound)));
    }

    #[tokio::test]
    async fn test_artist_pagination_follows_cursor() {
        let page_one = json!([
            {"id": 40, "tag_string": "a"},
            {"tag_string": "gated", "is_banned": true},
            {"id": 30, "tag_string": "b"}
        ]);
        let page_two = json!([{"id": 20, "tag_string": "c"}]);
        let transport = ScriptedTransport::new()
            .respond("posts.json?tags=some%20artist&limit=3", RawResponse::new(200, page_one.to_string()))
            .respond(
                "posts.json?tags=some%20artist&limit=3&page=b30",
                RawResponse::new(200, page_two.to_string()),
            );
        let options = ListingOptions { posts_per_page: 3, ..ListingOptions::default() };
        let mut cursor = ListingCursor::new(Identifier::Artist("some artist".to_string()), options);

        let entries = drain(&mut cursor, &transport).await.expect("entries");
        let ids: Vec<Option<u64>> = entries.iter().map(ListingEntry::post_id).collect();
        assert_eq!(ids, vec![Some(40), None, Some(30), Some(20)]);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_artist_pivot_is_clamped_and_limit_respected() {
        let transport = ScriptedTransport::new().respond(
            "posts.json?tags=wlop&limit=2&page=a10000000",
            RawResponse::new(200, json!([{"id": 10_000_001u64, "tag_string": "x"}, {"id": 10_000_002u64, "tag_string": "y"}]).to_string()),
        );
        let options = ListingOptions {
            artist_direction: Direction::After,
            artist_pivot: Some(99_999_999_999),
            artist_limit: Some(2),
            ..ListingOptions::default()
        };
        let mut cursor = ListingCursor::new(Identifier::Artist("wlop".to_string()), options);

        let entries = drain(&mut cursor, &transport).await.expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(transport.requests(), vec!["posts.json?tags=wlop&limit=2&page=a10000000".to_string()]);
    }

    #[tokio::test]
    async fn test_direct_post_is_single_entry() {
        let transport = ScriptedTransport::new();
        let mut cursor = ListingCursor::new(Identifier::Post(5), ListingOptions::default());
        let entries = drain(&mut cursor, &transport).await.expect("entries");
        assert_eq!(entries, vec![ListingEntry::Post(5)]);
        assert!(transport.requests().is_empty());
    }
}
