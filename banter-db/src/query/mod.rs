//! Query-shape primitives layered on the router
//!
//! - [`cursor`]: opaque, versioned pagination tokens
//! - [`keyset`]: cursor-anchored pagination over (created_at, id)
//! - [`batch`]: grouped per-conversation aggregates

pub mod batch;
pub mod cursor;
pub mod keyset;

pub use batch::{latest_messages, unread_counts, MessageSummary};
pub use cursor::Cursor;
pub use keyset::{KeysetPage, KeysetPaginator, SortOrder, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
