//! Opaque pagination cursors
//!
//! A cursor carries the composite sort key (created_at, id) of the last row
//! a page returned, plus the sort direction it was minted for, wrapped in a
//! versioned payload. Tokens are URL-safe base64 over compact JSON. Clients
//! treat them as opaque; any tampering or version drift decodes to a typed
//! error, never a panic.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbError, Result};

use super::keyset::SortOrder;

/// Current token payload version
const CURSOR_VERSION: u8 = 1;

/// Decoded position marker for keyset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Primary sort key of the last returned row
    pub created_at: DateTime<Utc>,
    /// Tiebreak key of the last returned row
    pub id: Uuid,
    /// Direction this cursor was minted for
    pub order: SortOrder,
}

/// Wire shape of the token; field names stay short on purpose
#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    v: u8,
    o: SortOrder,
    /// created_at as microseconds since the Unix epoch
    ts: i64,
    id: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid, order: SortOrder) -> Self {
        Self {
            created_at,
            id,
            order,
        }
    }

    /// Encode into an opaque URL-safe token
    pub fn encode(&self) -> String {
        let payload = CursorPayload {
            v: CURSOR_VERSION,
            o: self.order,
            ts: self.created_at.timestamp_micros(),
            id: self.id,
        };
        let json =
            serde_json::to_vec(&payload).expect("cursor payload serialization cannot fail");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a client-supplied token.
    ///
    /// Rejects bad base64, bad JSON, unknown versions, and out-of-range
    /// timestamps; the distinction only matters for the error message.
    pub fn decode(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| DbError::cursor_decode("token is not valid base64"))?;
        let payload: CursorPayload = serde_json::from_slice(&raw)
            .map_err(|_| DbError::cursor_decode("token payload is not valid"))?;
        if payload.v != CURSOR_VERSION {
            return Err(DbError::cursor_decode(format!(
                "unsupported cursor version {}",
                payload.v
            )));
        }
        let created_at = DateTime::from_timestamp_micros(payload.ts)
            .ok_or_else(|| DbError::cursor_decode("timestamp out of range"))?;
        Ok(Self {
            created_at,
            id: payload.id,
            order: payload.o,
        })
    }
}
