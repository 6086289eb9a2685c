//! Keyset pagination over (created_at, id)
//!
//! Pages are anchored to the composite sort key of the last returned row
//! instead of an offset, so concurrent inserts can never shift rows between
//! pages or show the same row twice. The paginator fetches one row beyond
//! the page size to learn whether more rows exist without a second query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::{DbError, Result};

use super::cursor::Cursor;

/// Largest page a caller can request
pub const MAX_PAGE_SIZE: u32 = 100;
/// Page size used by [`KeysetPaginator::default`]
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Traversal direction over the (created_at, id) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Newest first; the common direction for message history
    Desc,
    /// Oldest first
    Asc,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Desc
    }
}

impl SortOrder {
    fn sql_keyword(self) -> &'static str {
        match self {
            Self::Desc => "DESC",
            Self::Asc => "ASC",
        }
    }

    /// Row-value comparator that selects rows strictly past the cursor
    fn comparator(self) -> &'static str {
        match self {
            Self::Desc => "<",
            Self::Asc => ">",
        }
    }
}

/// One page of results plus the position marker for the next one
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetPage<T> {
    pub items: Vec<T>,
    /// Whether rows exist beyond this page
    pub has_more: bool,
    /// Present only when `has_more`; anchored to the last item
    pub next_cursor: Option<Cursor>,
}

impl<T> KeysetPage<T> {
    /// Encoded token for the next page, if one exists
    pub fn next_token(&self) -> Option<String> {
        self.next_cursor.as_ref().map(Cursor::encode)
    }
}

/// Builds and runs cursor-anchored queries.
///
/// The caller supplies a [`QueryBuilder`] holding the SELECT and an open
/// WHERE clause (use `WHERE TRUE` when there is no natural filter); the
/// paginator appends the cursor predicate, ordering, and limit.
#[derive(Debug, Clone, Copy)]
pub struct KeysetPaginator {
    page_size: u32,
    order: SortOrder,
    created_at_column: &'static str,
    id_column: &'static str,
}

impl Default for KeysetPaginator {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl KeysetPaginator {
    /// Newest-first paginator; `page_size` is clamped to `1..=MAX_PAGE_SIZE`
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            order: SortOrder::Desc,
            created_at_column: "created_at",
            id_column: "id",
        }
    }

    pub fn with_order(page_size: u32, order: SortOrder) -> Self {
        let mut paginator = Self::new(page_size);
        paginator.order = order;
        paginator
    }

    /// Override the key column names, e.g. when the query aliases its table
    pub fn key_columns(mut self, created_at: &'static str, id: &'static str) -> Self {
        self.created_at_column = created_at;
        self.id_column = id;
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Rows to fetch: one extra to detect whether another page exists
    fn fetch_size(&self) -> i64 {
        i64::from(self.page_size) + 1
    }

    /// Append the cursor predicate, ORDER BY, and LIMIT to `qb`.
    ///
    /// A cursor minted for the opposite direction is rejected; mixing
    /// directions would silently skip or repeat rows.
    pub fn apply(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        cursor: Option<&Cursor>,
    ) -> Result<()> {
        if let Some(cursor) = cursor {
            if cursor.order != self.order {
                return Err(DbError::cursor_decode(
                    "cursor was issued for the opposite sort direction",
                ));
            }
            qb.push(format!(
                " AND ({}, {}) {} (",
                self.created_at_column,
                self.id_column,
                self.order.comparator()
            ));
            qb.push_bind(cursor.created_at);
            qb.push(", ");
            qb.push_bind(cursor.id);
            qb.push(")");
        }
        let keyword = self.order.sql_keyword();
        qb.push(format!(
            " ORDER BY {} {keyword}, {} {keyword} LIMIT ",
            self.created_at_column, self.id_column
        ));
        qb.push_bind(self.fetch_size());
        Ok(())
    }

    /// Assemble a page from up to `page_size + 1` fetched rows.
    ///
    /// `key` extracts the sort key from a row; it anchors the next cursor
    /// to the last row actually returned.
    pub fn assemble<T, K>(&self, mut rows: Vec<T>, key: K) -> KeysetPage<T>
    where
        K: Fn(&T) -> (DateTime<Utc>, Uuid),
    {
        let has_more = rows.len() > self.page_size as usize;
        if has_more {
            rows.truncate(self.page_size as usize);
        }
        let next_cursor = if has_more {
            rows.last().map(|row| {
                let (created_at, id) = key(row);
                Cursor::new(created_at, id, self.order)
            })
        } else {
            None
        };
        KeysetPage {
            items: rows,
            has_more,
            next_cursor,
        }
    }

    /// Run the prepared query and assemble the page in one call
    pub async fn fetch_page<T, K>(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        cursor: Option<&Cursor>,
        pool: &PgPool,
        key: K,
    ) -> Result<KeysetPage<T>>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
        K: Fn(&T) -> (DateTime<Utc>, Uuid),
    {
        self.apply(qb, cursor)?;
        let rows: Vec<T> = qb.build_query_as().fetch_all(pool).await?;
        Ok(self.assemble(rows, key))
    }
}
