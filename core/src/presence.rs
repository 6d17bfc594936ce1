//! Presence tracking
//!
//! Remote carets are ephemeral: they are never persisted, never undone and
//! never part of the document. Each author has at most one entry, resolved
//! to local handles, and entries expire once the author has been inactive
//! for longer than [`INACTIVITY_LIMIT_MS`].
//!
//! Key differences from document operations:
//! - Last write wins per author (no history)
//! - Liveness comes from the author's own `lastActivity` stamp
//! - Unresolvable positions clear the entry instead of failing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tree::Point;
use crate::AuthorId;

/// How long an author may stay idle before their caret disappears
pub const INACTIVITY_LIMIT_MS: i64 = 10_000;

/// One remote caret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub author: AuthorId,
    pub anchor: Point,
    pub focus: Point,

    /// Epoch milliseconds
    pub last_activity: i64,
}

/// Change to the presence set, for UI consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub updated: Vec<AuthorId>,
    pub removed: Vec<AuthorId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence set of every remote author
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    states: HashMap<AuthorId, Presence>,
    limit_ms: i64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_limit(INACTIVITY_LIMIT_MS)
    }

    pub fn with_limit(limit_ms: i64) -> Self {
        Self {
            states: HashMap::new(),
            limit_ms,
        }
    }

    pub fn limit_ms(&self) -> i64 {
        self.limit_ms
    }

    /// Whether activity at `last_activity` is stale at `now`
    pub fn is_expired(&self, last_activity: i64, now: i64) -> bool {
        now - last_activity > self.limit_ms
    }

    /// All live entries
    pub fn get_states(&self) -> &HashMap<AuthorId, Presence> {
        &self.states
    }

    pub fn get(&self, author: &str) -> Option<&Presence> {
        self.states.get(author)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Record an author's caret
    ///
    /// Returns whether anything changed. Activity older than what is already
    /// known is ignored.
    pub fn update(&mut self, presence: Presence) -> bool {
        if let Some(existing) = self.states.get(&presence.author) {
            if existing.last_activity > presence.last_activity || *existing == presence {
                return false;
            }
        }
        self.states.insert(presence.author.clone(), presence);
        true
    }

    /// Drop an author's caret; returns whether one was present
    pub fn clear(&mut self, author: &str) -> bool {
        self.states.remove(author).is_some()
    }

    /// Remove authors inactive for longer than the limit
    pub fn remove_stale(&mut self, now: i64) -> Vec<AuthorId> {
        let limit = self.limit_ms;
        let mut removed = Vec::new();
        self.states.retain(|author, presence| {
            if now - presence.last_activity > limit {
                removed.push(author.clone());
                return false;
            }
            true
        });
        removed.sort();
        removed
    }

    /// Remove carets pointing at nodes that no longer exist
    pub fn retain_resolvable(&mut self, contains: impl Fn(&Point) -> bool) -> Vec<AuthorId> {
        let mut removed = Vec::new();
        self.states.retain(|author, presence| {
            if contains(&presence.anchor) && contains(&presence.focus) {
                return true;
            }
            removed.push(author.clone());
            false
        });
        removed.sort();
        removed
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
