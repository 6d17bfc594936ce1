//! Identifiers: durable node identities and log positions
//!
//! - **SyncId:** minted once per node and kept for the node's whole lifetime.
//!   Minted as a UUID v7 so ids sort roughly by creation time.
//! - **SequenceId:** the position the replicated log assigned to an operation.
//!   Rendered `"<millis>-<counter>"`, the same shape as stream ids.
//! - **SequenceClock:** hands out strictly increasing sequence ids from a wall
//!   clock, for logs (and peer meshes) that have to invent positions themselves.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Durable, globally unique node identity
///
/// Any string is a valid SyncId on the wire; locally minted ids are UUID v7.
///
/// # Example
///
/// ```rust
/// use docsync_core::ids::SyncId;
///
/// let a = SyncId::mint();
/// let b = SyncId::mint();
/// assert_ne!(a, b);
/// assert_eq!(SyncId::from("p1").as_str(), "p1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(String);

impl SyncId {
    /// Mint a fresh, time-ordered identity
    pub fn mint() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SyncId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SyncId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an operation in the replicated log
///
/// Ordered by milliseconds first, then by the per-millisecond counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SequenceId {
    /// Wall-clock (or synthetic) milliseconds
    pub millis: u64,

    /// Tiebreaker within the same millisecond
    pub counter: u64,
}

impl SequenceId {
    /// Position before any entry; a fresh log's tail
    pub const ZERO: SequenceId = SequenceId {
        millis: 0,
        counter: 0,
    };

    pub fn new(millis: u64, counter: u64) -> Self {
        Self { millis, counter }
    }
}

impl Ord for SequenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.millis.cmp(&other.millis) {
            Ordering::Equal => self.counter.cmp(&other.counter),
            other => other,
        }
    }
}

impl PartialOrd for SequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.counter)
    }
}

impl FromStr for SequenceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::Protocol(format!("invalid sequence id: {:?}", s));
        let (millis, counter) = match s.split_once('-') {
            Some((m, c)) => (m, c),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            counter: counter.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for SequenceId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SequenceId> for String {
    fn from(value: SequenceId) -> Self {
        value.to_string()
    }
}

/// Counter values reserved per millisecond for each salted clock slot
pub const CLOCK_SLOTS: u64 = 1 << 20;

/// Strictly increasing sequence id source
///
/// Each id is at least the wall clock, and always greater than every id this
/// clock has issued or observed. Observing remote ids keeps peers that
/// assign their own positions from handing out stale ones.
///
/// A salted clock only issues counters congruent to its salt modulo
/// [`CLOCK_SLOTS`], so clocks with different salts never issue the same id,
/// even within one millisecond.
#[derive(Debug, Clone)]
pub struct SequenceClock {
    last: Option<SequenceId>,
    salt: u64,
    stride: u64,
}

impl Default for SequenceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceClock {
    /// Create a clock that has issued nothing yet
    pub fn new() -> Self {
        Self {
            last: None,
            salt: 0,
            stride: 1,
        }
    }

    /// Create a clock whose ids never collide with other salts
    pub fn salted(salt: u64) -> Self {
        Self {
            last: None,
            salt: salt % CLOCK_SLOTS,
            stride: CLOCK_SLOTS,
        }
    }

    /// Last id issued or observed
    pub fn last(&self) -> Option<SequenceId> {
        self.last
    }

    /// Issue the next id using the current wall clock
    pub fn tick(&mut self) -> SequenceId {
        self.tick_at(now_millis().max(0) as u64)
    }

    /// Issue the next id for the given wall-clock reading
    pub fn tick_at(&mut self, now_ms: u64) -> SequenceId {
        let next = match self.last {
            Some(last) if now_ms <= last.millis => {
                let mut counter = last.counter - last.counter % self.stride + self.salt;
                if counter <= last.counter {
                    counter += self.stride;
                }
                SequenceId::new(last.millis, counter)
            }
            _ => SequenceId::new(now_ms, self.salt),
        };
        self.last = Some(next);
        next
    }

    /// Move past a remote id (never goes backwards)
    pub fn observe(&mut self, seen: SequenceId) {
        if self.last.map_or(true, |last| seen > last) {
            self.last = Some(seen);
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
