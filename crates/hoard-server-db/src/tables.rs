//! Database table definitions for the repository server.
//!
//! # Data Model Overview
//!
//! One redb file holds everything: the master definition store (stable ids
//! for hashes and tags, shared by all services), per-service repository rows,
//! accounts and sessions, the update index, and the deferred-delete queue.
//!
//! ## Key Concepts
//!
//! - **Master id**: a database-wide integer for a hash or tag, allocated on
//!   first sighting and never reused.
//! - **Service id map**: each service hands out its own dense
//!   [`ServiceHashId`]/[`ServiceTagId`] numbering in commit order, so update
//!   bundles can reference content compactly and definitions can be
//!   enumerated by creation window.
//! - **Row states**: for every content kind a row is in at most one of
//!   current/deleted, with pending (unapproved additions, keyed by master
//!   ids since nothing is committed yet) and petitioned (removal requests,
//!   keyed by service ids since they point at current rows) alongside.
//! - **Service info**: precomputed per-service totals, updated with a signed
//!   delta inside the same transaction as every row mutation, and
//!   regenerable from scratch by scanning the authoritative tables.
//! - **Petition index**: one entry per distinct `(account, reason)` petition
//!   per kind and status, with the row count as its value. This is what
//!   summaries and actionable counts read; row mutations maintain it.
//!
//! The original SQL schema suffixed table names with the service id; here
//! the [`ServiceId`] is the leading key component of shared tables instead,
//! and range scans take the place of per-table queries.

use bincode::{Decode, Encode};
use hoard_core::account::{AccountType, BanInfo};
use hoard_core::bandwidth::BandwidthTracker;
use hoard_core::content::ContentKind;
use hoard_core::id::{
    AccessKey, AccessKeyDigest, AccountKey, FileHash, RegistrationKeyDigest, ServiceKey,
    SessionKey, UpdateHash,
};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::tag::Tag;
use hoard_core::update::PetitionStatus;
use hoard_core::{
    AccountId, AccountTypeId, MasterHashId, MasterTagId, ReasonId, ServiceHashId, ServiceId,
    ServiceTagId, Timestamp,
};
use serde::Serialize;

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

/// Database-wide id counters.
#[derive(
    Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum MasterCounterKind {
    MasterHash,
    MasterTag,
    Reason,
    Service,
}

def_table! {
    /// Next-id allocation for database-wide numbering.
    master_counters: MasterCounterKind => u64
}

/// Per-service id counters.
#[derive(
    Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ServiceCounterKind {
    ServiceHash,
    ServiceTag,
    Account,
    AccountType,
}

def_table! {
    /// Next-id allocation for per-service numbering.
    service_counters: (ServiceId, ServiceCounterKind) => u64
}

// ============================================================================
// MASTER DEFINITION STORE
// Stable ids for hashes and tags, shared across services.
// ============================================================================

def_table! {
    master_hashes: MasterHashId => FileHash
}

def_table! {
    master_hash_ids: FileHash => MasterHashId
}

def_table! {
    master_tags: MasterTagId => Tag
}

def_table! {
    /// Tags are normalized before this lookup; see `hoard_core::tag`.
    master_tag_ids: Tag => MasterTagId
}

def_table! {
    /// Interned petition reasons.
    reasons: ReasonId => String
}

def_table! {
    reason_ids: String => ReasonId
}

/// File metadata as supplied at upload, master-scoped (shared by every
/// service that carries the file).
#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FileInfoRecord {
    pub size: u64,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
    pub num_frames: Option<u32>,
    pub num_words: Option<u32>,
}

def_table! {
    file_infos: MasterHashId => FileInfoRecord
}

// ============================================================================
// PER-SERVICE ID MAPS
// ============================================================================

/// A per-service definition: dense id plus when the service first saw it.
/// Ids are allocated in commit order, so an id range walk is also a
/// creation-time walk; the bundler relies on this when cutting definition
/// windows.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServiceHashIdRecord {
    pub hash_id: ServiceHashId,
    pub created_at: Timestamp,
}

def_table! {
    service_hash_ids: (ServiceId, MasterHashId) => ServiceHashIdRecord
}

def_table! {
    /// Reverse of `service_hash_ids`.
    service_hashes: (ServiceId, ServiceHashId) => MasterHashId
}

#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServiceTagIdRecord {
    pub tag_id: ServiceTagId,
    pub created_at: Timestamp,
}

def_table! {
    service_tag_ids: (ServiceId, MasterTagId) => ServiceTagIdRecord
}

def_table! {
    /// Reverse of `service_tag_ids`.
    service_tags: (ServiceId, ServiceTagId) => MasterTagId
}

// ============================================================================
// SERVICES
// ============================================================================

#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub kind: ServiceKind,
    pub name: String,
    pub port: u16,
    pub options: ServiceOptions,
    /// Sentinel account that owns nullified rows; provisioned at service
    /// creation and never usable for anything else.
    pub null_account_id: AccountId,
    pub null_account_type_id: AccountTypeId,
}

def_table! {
    services: ServiceId => ServiceRecord
}

def_table! {
    service_ids: ServiceKey => ServiceId
}

/// Repository sync/nullification cursor state, mutated on a different
/// cadence than the service record itself.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct RepoStateRecord {
    pub next_update_due: Timestamp,
    pub next_nullification_update_index: u64,
}

def_table! {
    repo_states: ServiceId => RepoStateRecord
}

/// The precomputed per-service totals.
#[derive(
    Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ServiceInfoKind {
    NumFiles,
    NumDeletedFiles,
    NumPendingFiles,
    NumPetitionedFiles,
    NumMappings,
    NumDeletedMappings,
    NumPendingMappings,
    NumPetitionedMappings,
    NumTagParents,
    NumDeletedTagParents,
    NumPendingTagParents,
    NumPetitionedTagParents,
    NumTagSiblings,
    NumDeletedTagSiblings,
    NumPendingTagSiblings,
    NumPetitionedTagSiblings,
    /// Total bytes of current files, for the max-storage check.
    FileStorageBytes,
}

impl ServiceInfoKind {
    pub fn current(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Files => ServiceInfoKind::NumFiles,
            ContentKind::Mappings => ServiceInfoKind::NumMappings,
            ContentKind::TagParents => ServiceInfoKind::NumTagParents,
            ContentKind::TagSiblings => ServiceInfoKind::NumTagSiblings,
        }
    }

    pub fn deleted(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Files => ServiceInfoKind::NumDeletedFiles,
            ContentKind::Mappings => ServiceInfoKind::NumDeletedMappings,
            ContentKind::TagParents => ServiceInfoKind::NumDeletedTagParents,
            ContentKind::TagSiblings => ServiceInfoKind::NumDeletedTagSiblings,
        }
    }

    pub fn pending(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Files => ServiceInfoKind::NumPendingFiles,
            ContentKind::Mappings => ServiceInfoKind::NumPendingMappings,
            ContentKind::TagParents => ServiceInfoKind::NumPendingTagParents,
            ContentKind::TagSiblings => ServiceInfoKind::NumPendingTagSiblings,
        }
    }

    pub fn petitioned(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Files => ServiceInfoKind::NumPetitionedFiles,
            ContentKind::Mappings => ServiceInfoKind::NumPetitionedMappings,
            ContentKind::TagParents => ServiceInfoKind::NumPetitionedTagParents,
            ContentKind::TagSiblings => ServiceInfoKind::NumPetitionedTagSiblings,
        }
    }
}

def_table! {
    /// Signed so an interleaving of deltas can transiently dip; consistency
    /// with the row tables is checked by `regenerate_service_info`.
    service_info: (ServiceId, ServiceInfoKind) => i64
}

// ============================================================================
// ACCOUNTS
// ============================================================================

#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountTypeRecord {
    pub account_type: AccountType,
    /// Usage history backing the auto-creation velocity check.
    pub auto_create_history: BandwidthTracker,
}

def_table! {
    account_types: (ServiceId, AccountTypeId) => AccountTypeRecord
}

#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
    pub key: AccountKey,
    pub account_type_id: AccountTypeId,
    pub created_at: Timestamp,
    /// `None`: never expires.
    pub expires_at: Option<Timestamp>,
    pub access_key_digest: AccessKeyDigest,
    pub ban: Option<BanInfo>,
    pub message: Option<(String, Timestamp)>,
    /// Cumulative petition reward; feeds reputation logic elsewhere.
    pub petition_score: i64,
}

def_table! {
    accounts: (ServiceId, AccountId) => AccountRecord
}

def_table! {
    account_ids: (ServiceId, AccountKey) => AccountId
}

def_table! {
    account_ids_by_access: (ServiceId, AccessKeyDigest) => AccountId
}

def_table! {
    /// Rolling usage per account, persisted so quotas survive restarts.
    account_bandwidth: (ServiceId, AccountId) => BandwidthTracker
}

/// An unredeemed registration. Holds the raw access key (the only place one
/// is ever stored) until `resolve_access_key` burns the row.
#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub account_type_id: AccountTypeId,
    pub account_key: AccountKey,
    pub access_key: AccessKey,
    pub expires_at: Option<Timestamp>,
}

def_table! {
    registration_keys: (ServiceId, RegistrationKeyDigest) => RegistrationRecord
}

def_table! {
    /// Finds the registration row holding a given (current) access key, so
    /// redemption can locate it by the secret the client presents.
    registration_access_index: (ServiceId, AccessKeyDigest) => RegistrationKeyDigest
}

#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub account_key: AccountKey,
    pub expires_at: Timestamp,
}

def_table! {
    /// Persisted sessions; the in-memory session manager rehydrates from
    /// here at boot and drops rows past expiry.
    sessions: (ServiceId, SessionKey) => SessionRecord
}

// ============================================================================
// REPOSITORY ROWS
// ============================================================================

/// A committed (current or deleted) row.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct RowRecord {
    pub account_id: AccountId,
    /// Commit time; for deleted rows, commit-of-deletion.
    pub committed_at: Timestamp,
}

/// A pending or petitioned row.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueuedRecord {
    pub reason_id: ReasonId,
}

def_table! {
    files_current: (ServiceId, ServiceHashId) => RowRecord
}

def_table! {
    files_deleted: (ServiceId, ServiceHashId) => RowRecord
}

def_table! {
    /// Pending rows are keyed by master ids: nothing has been committed, so
    /// no service id exists yet.
    files_pending: (ServiceId, MasterHashId, AccountId) => QueuedRecord
}

def_table! {
    files_petitioned: (ServiceId, ServiceHashId, AccountId) => QueuedRecord
}

def_table! {
    /// Key: (service, tag, hash).
    mappings_current: (ServiceId, ServiceTagId, ServiceHashId) => RowRecord
}

def_table! {
    mappings_deleted: (ServiceId, ServiceTagId, ServiceHashId) => RowRecord
}

def_table! {
    mappings_pending: (ServiceId, MasterTagId, MasterHashId, AccountId) => QueuedRecord
}

def_table! {
    mappings_petitioned: (ServiceId, ServiceTagId, ServiceHashId, AccountId) => QueuedRecord
}

def_table! {
    /// Key: (service, child, parent).
    tag_parents_current: (ServiceId, ServiceTagId, ServiceTagId) => RowRecord
}

def_table! {
    tag_parents_deleted: (ServiceId, ServiceTagId, ServiceTagId) => RowRecord
}

def_table! {
    tag_parents_pending: (ServiceId, MasterTagId, MasterTagId, AccountId) => QueuedRecord
}

def_table! {
    tag_parents_petitioned: (ServiceId, ServiceTagId, ServiceTagId, AccountId) => QueuedRecord
}

/// A current sibling row; the bad tag is the key, so a bad tag maps to at
/// most one good tag at a time.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SiblingRecord {
    pub good_id: ServiceTagId,
    pub account_id: AccountId,
    pub committed_at: Timestamp,
}

def_table! {
    /// Key: (service, bad). See [`SiblingRecord`].
    tag_siblings_current: (ServiceId, ServiceTagId) => SiblingRecord
}

def_table! {
    /// Key: (service, bad, good); a bad tag can accumulate several deleted
    /// pairings over its history.
    tag_siblings_deleted: (ServiceId, ServiceTagId, ServiceTagId) => RowRecord
}

def_table! {
    tag_siblings_pending: (ServiceId, MasterTagId, MasterTagId, AccountId) => QueuedRecord
}

def_table! {
    tag_siblings_petitioned: (ServiceId, ServiceTagId, ServiceTagId, AccountId) => QueuedRecord
}

def_table! {
    /// One entry per distinct (account, reason) petition; value is how many
    /// underlying rows it covers. Summaries and actionable counts read this
    /// instead of scanning row tables.
    petition_index: (ServiceId, ContentKind, PetitionStatus, AccountId, ReasonId) => u64
}

// ============================================================================
// UPDATES
// ============================================================================

#[derive(Encode, Decode, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateMetadataRecord {
    pub update_hashes: Vec<UpdateHash>,
    pub begin: Timestamp,
    pub end: Timestamp,
}

def_table! {
    /// The per-service update index, keyed by update number.
    update_metadata: (ServiceId, u64) => UpdateMetadataRecord
}

def_table! {
    /// Every bundle blob a service references. Membership here keeps the
    /// blob out of the orphan filter.
    updates: (ServiceId, UpdateHash) => u64
}

// ============================================================================
// DEFERRED PHYSICAL DELETES
// ============================================================================

/// A blob awaiting physical deletion. The row stays until the filesystem
/// delete succeeds, so a crash mid-delete retries instead of leaking.
#[derive(Encode, Decode, Serialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeferredDeleteRecord {
    pub file: bool,
    pub thumbnail: bool,
}

def_table! {
    deferred_deletes: MasterHashId => DeferredDeleteRecord
}
