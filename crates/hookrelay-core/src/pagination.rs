//! Cursor pagination primitives.
//!
//! Listings page over time-ordered ids with an opaque cursor. Reads fetch
//! `per_page + 1` rows so `has_next` is known without a count query; a
//! separate single-row count supplies `prev_row_count` ("how many rows sit
//! behind the current page").

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size for listings.
pub const DEFAULT_PER_PAGE: i64 = 20;

/// Upper bound on page size accepted from callers.
pub const MAX_PER_PAGE: i64 = 1000;

/// Paging direction relative to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    /// Rows at or after the cursor in display order.
    #[default]
    Next,
    /// Rows before the cursor in display order.
    Prev,
}

/// Paging request: cursor, page size, direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pageable {
    /// Opaque cursor; `None` starts from the newest row.
    pub cursor: Option<Uuid>,
    /// Rows per page.
    pub per_page: i64,
    /// Paging direction.
    pub direction: PageDirection,
}

impl Default for Pageable {
    fn default() -> Self {
        Self { cursor: None, per_page: DEFAULT_PER_PAGE, direction: PageDirection::Next }
    }
}

impl Pageable {
    /// Clamps the page size into the accepted range.
    pub fn clamped(mut self) -> Self {
        self.per_page = self.per_page.clamp(1, MAX_PER_PAGE);
        self
    }

    /// Rows to fetch: one extra row proves the next page exists.
    pub fn limit(&self) -> i64 {
        self.per_page + 1
    }
}

/// Paging metadata returned with every listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaginationData {
    /// Page size that produced this page.
    pub per_page: i64,
    /// Cursor for the following page.
    pub next_cursor: Option<Uuid>,
    /// Cursor for the preceding page.
    pub prev_cursor: Option<Uuid>,
    /// Whether a following page exists.
    pub has_next: bool,
    /// Whether a preceding page exists.
    pub has_prev: bool,
    /// Rows behind the first row of this page.
    pub prev_row_count: i64,
}

impl PaginationData {
    /// Builds paging metadata from a trimmed page.
    ///
    /// `page_ids` holds the final page in display order (newest first);
    /// `has_more` reports whether the `per_page + 1` fetch found a surplus
    /// row past the page in query order. `prev_row_count` comes from the
    /// behind-the-page-head count query and decides `has_prev`.
    pub fn build(pageable: &Pageable, page_ids: &[Uuid], has_more: bool, prev_row_count: i64) -> Self {
        // Paging backward, the rows we came from are always still ahead.
        let has_next = match pageable.direction {
            PageDirection::Next => has_more,
            PageDirection::Prev => !page_ids.is_empty(),
        };

        Self {
            per_page: pageable.per_page,
            next_cursor: if has_next { page_ids.last().copied() } else { None },
            prev_cursor: page_ids.first().copied(),
            has_next,
            has_prev: prev_row_count > 0,
            prev_row_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|i| Uuid::from_u128(1000 - i as u128)).collect()
    }

    #[test]
    fn surplus_row_signals_next_page() {
        let pageable = Pageable { per_page: 3, ..Default::default() };
        let page_ids = ids(3);

        let page = PaginationData::build(&pageable, &page_ids, true, 0);
        assert!(page.has_next);
        assert_eq!(page.next_cursor, Some(page_ids[2]));
        assert_eq!(page.prev_cursor, Some(page_ids[0]));
        assert!(!page.has_prev);
    }

    #[test]
    fn short_page_has_no_next() {
        let pageable = Pageable { per_page: 5, ..Default::default() };
        let page_ids = ids(2);

        let page = PaginationData::build(&pageable, &page_ids, false, 7);
        assert!(!page.has_next);
        assert!(page.next_cursor.is_none());
        assert!(page.has_prev);
        assert_eq!(page.prev_row_count, 7);
    }

    #[test]
    fn prev_pages_always_lead_somewhere_newer() {
        let pageable = Pageable {
            per_page: 3,
            direction: PageDirection::Prev,
            cursor: Some(Uuid::from_u128(500)),
        };
        let page_ids = ids(3);

        let page = PaginationData::build(&pageable, &page_ids, false, 0);
        // The page we paged back from still exists ahead of us.
        assert!(page.has_next);
        assert_eq!(page.next_cursor, Some(page_ids[2]));
    }

    #[test]
    fn empty_page_builds_cleanly() {
        let pageable = Pageable::default();
        let page = PaginationData::build(&pageable, &[], false, 0);
        assert!(!page.has_next);
        assert!(!page.has_prev);
        assert!(page.next_cursor.is_none());
        assert!(page.prev_cursor.is_none());
    }

    #[test]
    fn per_page_is_clamped() {
        let pageable = Pageable { per_page: 1_000_000_000_000, ..Default::default() }.clamped();
        assert_eq!(pageable.per_page, MAX_PER_PAGE);
        let pageable = Pageable { per_page: 0, ..Default::default() }.clamped();
        assert_eq!(pageable.per_page, 1);
    }
}
