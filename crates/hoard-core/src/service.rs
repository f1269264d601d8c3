//! Service kinds and their runtime options.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::tag::TagFilter;

pub const MIN_UPDATE_PERIOD_SECS: u64 = 600;
pub const MAX_UPDATE_PERIOD_SECS: u64 = 100_000 * 100;
pub const DEFAULT_UPDATE_PERIOD_SECS: u64 = 100_000;

pub const MIN_NULLIFICATION_PERIOD_SECS: u64 = 3_600;
pub const MAX_NULLIFICATION_PERIOD_SECS: u64 = 365 * 86_400;
pub const DEFAULT_NULLIFICATION_PERIOD_SECS: u64 = 90 * 86_400;

#[derive(
    Encode,
    Decode,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum ServiceKind {
    Admin,
    FileRepo,
    TagRepo,
}

impl ServiceKind {
    pub fn is_repository(self) -> bool {
        matches!(self, ServiceKind::FileRepo | ServiceKind::TagRepo)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Admin => "admin",
            ServiceKind::FileRepo => "file repository",
            ServiceKind::TagRepo => "tag repository",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-service options.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    /// How wide each update window is, seconds.
    pub update_period_secs: u64,
    /// How old a window must be before authorship is erased, seconds.
    pub nullification_period_secs: u64,
    /// Namespace filter applied to incoming tags (tag repos).
    pub tag_filter: TagFilter,
    /// Total file-store byte cap; `None` means unlimited. Moderators bypass.
    pub max_storage: Option<u64>,
    /// Whether the external layer should record uploader IPs.
    pub log_uploader_ips: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            update_period_secs: DEFAULT_UPDATE_PERIOD_SECS,
            nullification_period_secs: DEFAULT_NULLIFICATION_PERIOD_SECS,
            tag_filter: TagFilter::allow_all(),
            max_storage: None,
            log_uploader_ips: false,
        }
    }
}

impl ServiceOptions {
    pub fn clamped_update_period(&self) -> u64 {
        self.update_period_secs
            .clamp(MIN_UPDATE_PERIOD_SECS, MAX_UPDATE_PERIOD_SECS)
    }

    pub fn clamped_nullification_period(&self) -> u64 {
        self.nullification_period_secs
            .clamp(MIN_NULLIFICATION_PERIOD_SECS, MAX_NULLIFICATION_PERIOD_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_clamping() {
        let options = ServiceOptions {
            update_period_secs: 1,
            nullification_period_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(options.clamped_update_period(), MIN_UPDATE_PERIOD_SECS);
        assert_eq!(
            options.clamped_nullification_period(),
            MAX_NULLIFICATION_PERIOD_SECS
        );
    }
}
