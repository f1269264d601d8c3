//! Account types, permissions, and the wire view of an account.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::bandwidth::{BandwidthRules, BandwidthSummary, BandwidthTracker};
use crate::content::ContentKind;
use crate::id::{AccountKey, AccountTypeKey};
use crate::service::ServiceKind;

/// What a permission applies to.
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
pub enum ContentScope {
    Accounts,
    AccountTypes,
    Options,
    Files,
    Mappings,
    TagParents,
    TagSiblings,
    Services,
}

impl From<ContentKind> for ContentScope {
    fn from(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Files => ContentScope::Files,
            ContentKind::Mappings => ContentScope::Mappings,
            ContentKind::TagParents => ContentScope::TagParents,
            ContentKind::TagSiblings => ContentScope::TagSiblings,
        }
    }
}

/// Permission levels, ordered: holding a level grants everything below it.
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
pub enum PermissionLevel {
    Petition,
    Create,
    Moderate,
}

/// A `{scope → level}` map with downward implication on lookup.
#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
pub struct Permissions(BTreeMap<ContentScope, PermissionLevel>);

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, scope: ContentScope, level: PermissionLevel) {
        self.0.insert(scope, level);
    }

    pub fn has(&self, scope: ContentScope, level: PermissionLevel) -> bool {
        self.0.get(&scope).is_some_and(|held| level <= *held)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContentScope, PermissionLevel)> + '_ {
        self.0.iter().map(|(s, l)| (*s, *l))
    }
}

/// An account type: a named permission set with bandwidth rules and an
/// auto-creation allowance.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountType {
    pub key: AccountTypeKey,
    pub title: String,
    pub permissions: Permissions,
    pub bandwidth_rules: BandwidthRules,
    /// `(accounts, period_secs)`; zero accounts disables auto-creation.
    pub auto_create_velocity: (u64, u64),
    /// The null type grants nothing, ever; it exists only to own nullified
    /// rows.
    pub is_null: bool,
}

impl AccountType {
    pub fn new(title: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            key: AccountTypeKey::generate(),
            title: title.into(),
            permissions,
            bandwidth_rules: BandwidthRules::none(),
            auto_create_velocity: (0, 86_400),
            is_null: false,
        }
    }

    /// The administrator type provisioned with every new service.
    pub fn admin(service_kind: ServiceKind) -> Self {
        let mut permissions = Permissions::new();
        permissions.grant(ContentScope::Accounts, PermissionLevel::Moderate);
        permissions.grant(ContentScope::AccountTypes, PermissionLevel::Moderate);
        permissions.grant(ContentScope::Options, PermissionLevel::Moderate);
        match service_kind {
            ServiceKind::Admin => {
                permissions.grant(ContentScope::Services, PermissionLevel::Moderate);
            }
            ServiceKind::FileRepo => {
                permissions.grant(ContentScope::Files, PermissionLevel::Moderate);
            }
            ServiceKind::TagRepo => {
                permissions.grant(ContentScope::Mappings, PermissionLevel::Moderate);
                permissions.grant(ContentScope::TagParents, PermissionLevel::Moderate);
                permissions.grant(ContentScope::TagSiblings, PermissionLevel::Moderate);
            }
        }
        Self::new("administrator", permissions)
    }

    /// The sentinel type that owns nullified rows.
    pub fn null() -> Self {
        Self {
            is_null: true,
            ..Self::new("null account", Permissions::new())
        }
    }

    pub fn has_permission(&self, scope: ContentScope, level: PermissionLevel) -> bool {
        if self.is_null {
            return false;
        }
        self.permissions.has(scope, level)
    }

    pub fn supports_auto_create(&self) -> bool {
        !self.is_null && self.auto_create_velocity.0 > 0
    }

    /// Whether the auto-creation allowance still has room, judged against
    /// the type's own creation-history tracker.
    pub fn can_auto_create_now(&self, history: &BandwidthTracker, now: Timestamp) -> bool {
        if !self.supports_auto_create() {
            return false;
        }
        let (count, period) = self.auto_create_velocity;
        let created = history.usage(
            crate::bandwidth::BandwidthKind::Requests,
            crate::bandwidth::BandwidthWindow::Seconds(period),
            now,
        );
        created < count
    }
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BanInfo {
    pub reason: String,
    pub banned_at: Timestamp,
    /// `None`: permanent.
    pub banned_until: Option<Timestamp>,
}

/// The server's externally visible picture of one account.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug)]
pub struct AccountView {
    pub key: AccountKey,
    pub account_type: AccountType,
    pub created_at: Timestamp,
    /// `None`: never expires.
    pub expires_at: Option<Timestamp>,
    pub ban: Option<BanInfo>,
    pub message: Option<(String, Timestamp)>,
    pub bandwidth: BandwidthSummary,
}

impl AccountView {
    pub fn is_banned(&self, now: Timestamp) -> bool {
        match &self.ban {
            None => false,
            Some(ban) => match ban.banned_until {
                None => true,
                Some(until) => !until.has_passed(now),
            },
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at.has_passed(now))
    }

    /// Admins moderate the service roster; they skip every other check
    /// except ban and expiry.
    pub fn is_admin(&self) -> bool {
        self.account_type
            .has_permission(ContentScope::Services, PermissionLevel::Moderate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_implication_is_downward() {
        let mut permissions = Permissions::new();
        permissions.grant(ContentScope::Mappings, PermissionLevel::Create);

        assert!(permissions.has(ContentScope::Mappings, PermissionLevel::Petition));
        assert!(permissions.has(ContentScope::Mappings, PermissionLevel::Create));
        assert!(!permissions.has(ContentScope::Mappings, PermissionLevel::Moderate));
        assert!(!permissions.has(ContentScope::Files, PermissionLevel::Petition));
    }

    #[test]
    fn null_type_grants_nothing() {
        let mut null = AccountType::null();
        // even explicit grants are dead in a null type
        null.permissions
            .grant(ContentScope::Files, PermissionLevel::Moderate);
        assert!(!null.has_permission(ContentScope::Files, PermissionLevel::Petition));
        assert!(!null.supports_auto_create());
    }

    #[test]
    fn admin_type_moderates_its_repo_content() {
        let tag_admin = AccountType::admin(ServiceKind::TagRepo);
        assert!(tag_admin.has_permission(ContentScope::Mappings, PermissionLevel::Moderate));
        assert!(tag_admin.has_permission(ContentScope::TagSiblings, PermissionLevel::Moderate));
        assert!(!tag_admin.has_permission(ContentScope::Files, PermissionLevel::Petition));

        let server_admin = AccountType::admin(ServiceKind::Admin);
        assert!(server_admin.has_permission(ContentScope::Services, PermissionLevel::Moderate));
    }

    #[test]
    fn auto_create_velocity_caps_per_period() {
        let mut account_type = AccountType::new("open door", Permissions::new());
        account_type.auto_create_velocity = (2, 3600);

        let mut history = BandwidthTracker::new();
        let now = Timestamp::from_secs(50_000);
        assert!(account_type.can_auto_create_now(&history, now));

        history.report_request(now, 0);
        history.report_request(now, 0);
        assert!(!account_type.can_auto_create_now(&history, now));

        // the window slides
        assert!(account_type.can_auto_create_now(&history, Timestamp::from_secs(53_700)));
    }

    #[test]
    fn ban_and_expiry_checks() {
        let mut view = AccountView {
            key: AccountKey::from_bytes([1; 32]),
            account_type: AccountType::new("user", Permissions::new()),
            created_at: Timestamp::from_secs(100),
            expires_at: Some(Timestamp::from_secs(1_000)),
            ban: None,
            message: None,
            bandwidth: BandwidthSummary::default(),
        };

        let now = Timestamp::from_secs(500);
        assert!(!view.is_banned(now));
        assert!(!view.is_expired(now));
        assert!(view.is_expired(Timestamp::from_secs(1_000)));

        view.ban = Some(BanInfo {
            reason: "spam".into(),
            banned_at: now,
            banned_until: Some(Timestamp::from_secs(600)),
        });
        assert!(view.is_banned(now));
        assert!(!view.is_banned(Timestamp::from_secs(600)));

        view.ban = Some(BanInfo {
            reason: "spam".into(),
            banned_at: now,
            banned_until: None,
        });
        assert!(view.is_banned(Timestamp::MAX));
    }
}
