//! Job identifiers.
//!
//! Ids double as the queue's insertion-order sort key: a UUIDv7 embeds its
//! issue time in the high bits, so ids allocated later compare greater,
//! and the ordering survives restarts because it lives in the id itself
//! rather than in any in-process counter.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique, time-ordered identifier for a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate an id for a job enqueued now.
    ///
    /// Ids issued in a later millisecond always sort after earlier ones;
    /// within the same millisecond the tiebreak is random but still unique.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The issue time embedded in the id, at millisecond granularity.
    ///
    /// `None` only for ids deserialized from a non-v7 UUID.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
