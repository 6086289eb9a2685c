//! Endpoint names and the replica-eligibility policy
//!
//! Logical endpoint names ("message.history", "conversation.list") identify
//! call sites to the router. The policy is the set of endpoints allowed on
//! the replica; everything else reads from primary. The set is loaded at
//! startup and may be replaced at runtime without restarting.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{DbError, Result};

/// Maximum length for endpoint names
const MAX_ENDPOINT_LEN: usize = 128;

/// Validated logical endpoint name.
///
/// Dot-separated slug segments: lowercase alphanumeric with hyphens and
/// underscores, starting with an alphanumeric. Matches what operators put
/// in `DB_REPLICA_ENDPOINTS`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    /// Create a new endpoint name, validating the format.
    ///
    /// # Example
    /// ```
    /// use banter_db::Endpoint;
    ///
    /// assert!(Endpoint::new("message.history").is_ok());
    /// assert!(Endpoint::new("Message.History").is_err());  // uppercase
    /// assert!(Endpoint::new("message..history").is_err()); // empty segment
    /// ```
    pub fn new(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(DbError::config("endpoint name is empty"));
        }
        if s.len() > MAX_ENDPOINT_LEN {
            return Err(DbError::config(format!(
                "endpoint name exceeds {MAX_ENDPOINT_LEN} characters: '{s}'"
            )));
        }
        for segment in s.split('.') {
            let starts_alnum = segment
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            let valid_chars = segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
            if !starts_alnum || !valid_chars {
                return Err(DbError::config(format!(
                    "endpoint name must be dot-separated lowercase slugs: '{s}'"
                )));
            }
        }
        Ok(Self(s.to_owned()))
    }

    /// Get the endpoint name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Endpoint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which endpoints may be served from the replica.
///
/// Readers clone the inner `Arc` and drop the guard immediately, so lookups
/// on the read hot path never hold the lock across other work. Updates
/// build a fresh set and swap it in whole.
#[derive(Debug)]
pub struct RoutingPolicy {
    eligible: RwLock<Arc<HashSet<Endpoint>>>,
}

impl RoutingPolicy {
    /// Create a policy from already-validated endpoints
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            eligible: RwLock::new(Arc::new(endpoints.into_iter().collect())),
        }
    }

    /// Create a policy from endpoint names, validating each.
    ///
    /// This is the `DB_REPLICA_ENDPOINTS` entry point; a malformed name is
    /// a config error rather than a silently ignored entry.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = names
            .into_iter()
            .map(|name| Endpoint::new(name.as_ref()))
            .collect::<Result<HashSet<_>>>()?;
        Ok(Self {
            eligible: RwLock::new(Arc::new(endpoints)),
        })
    }

    /// Whether this endpoint may be routed to the replica
    pub fn allows(&self, endpoint: &Endpoint) -> bool {
        self.current().contains(endpoint)
    }

    /// Replace the whole eligible set atomically
    pub fn replace(&self, endpoints: impl IntoIterator<Item = Endpoint>) {
        let next = Arc::new(endpoints.into_iter().collect::<HashSet<_>>());
        *self.write_guard() = next;
    }

    /// Add one endpoint (copy-on-write)
    pub fn insert(&self, endpoint: Endpoint) {
        let mut guard = self.write_guard();
        let mut next = HashSet::clone(&guard);
        next.insert(endpoint);
        *guard = Arc::new(next);
    }

    /// Remove one endpoint (copy-on-write)
    pub fn remove(&self, endpoint: &Endpoint) {
        let mut guard = self.write_guard();
        if !guard.contains(endpoint) {
            return;
        }
        let mut next = HashSet::clone(&guard);
        next.remove(endpoint);
        *guard = Arc::new(next);
    }

    /// The current eligible set (point-in-time)
    pub fn current(&self) -> Arc<HashSet<Endpoint>> {
        // A poisoned lock only means a writer panicked mid-swap; the Arc
        // inside is still a complete set.
        let guard = self
            .eligible
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Arc<HashSet<Endpoint>>> {
        self.eligible
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RoutingPolicy {
    /// Empty policy: nothing is replica-eligible until configured
    fn default() -> Self {
        Self::new([])
    }
}
