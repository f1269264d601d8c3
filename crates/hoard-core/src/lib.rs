pub mod account;
pub mod bandwidth;
pub mod content;
pub mod error;
pub mod id;
mod macros;
pub mod service;
pub mod tag;
pub mod update;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Unix timestamp, seconds.
///
/// Row commit times, update windows, expiries and bans all use second
/// precision; sub-second ordering inside one serializer job is meaningless
/// anyway since each job commits atomically.
#[derive(
    Encode,
    Decode,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Clock before unix epoch")
                .as_secs(),
        )
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> u64 {
        self.0
    }

    pub const fn saturating_add_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    pub const fn saturating_sub_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }

    /// `true` once `self` is in the past (relative to `now`).
    pub fn has_passed(self, now: Timestamp) -> bool {
        self.0 <= now.0
    }

    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_secs(self.0.saturating_sub(earlier.0))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

define_integer_id!(
    /// Per-service numbering, allocated when a service is created.
    struct ServiceId
);

define_integer_id!(
    /// Database-wide stable id for a file hash.
    struct MasterHashId
);

define_integer_id!(
    /// Database-wide stable id for a tag.
    struct MasterTagId
);

define_integer_id!(
    /// Dense per-service id for a file hash.
    ///
    /// Allocated in commit order, so enumerating a contiguous id range walks
    /// definitions in the order they were first published by the service.
    struct ServiceHashId
);

define_integer_id!(
    /// Dense per-service id for a tag. See [`ServiceHashId`].
    struct ServiceTagId
);

define_integer_id!(
    /// Internal row id of an account within one service.
    struct AccountId
);

define_integer_id!(
    struct AccountTypeId
);

define_integer_id!(
    /// Interned petition reason string.
    struct ReasonId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_passing() {
        let now = Timestamp::from_secs(1000);
        assert!(Timestamp::from_secs(999).has_passed(now));
        assert!(Timestamp::from_secs(1000).has_passed(now));
        assert!(!Timestamp::from_secs(1001).has_passed(now));
    }

    #[test]
    fn integer_id_roundtrip() {
        let id = ServiceHashId::new(7);
        assert_eq!(id.next().get(), 8);
        assert_eq!(u64::from(id), 7);
        assert_eq!(ServiceHashId::from(7), id);
    }
}
