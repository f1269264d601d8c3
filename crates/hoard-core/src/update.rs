//! Update bundles and client submissions.
//!
//! Bundles are immutable: the SHA-256 of the serialized bytes is the
//! identity a client fetches them by, so the encoding must be stable.
//! Every variant carries an explicit version tag; decoding an unknown
//! version is an error, and a format change is a new variant plus a
//! `version_bump` on the old one, never an in-place edit.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

use crate::content::{ClientAction, ClientContent, ContentKind, FileInfo};
use crate::id::{AccountKey, FileHash, UpdateHash};
use crate::tag::Tag;
use crate::{ServiceHashId, ServiceTagId, Timestamp};

/// Rows per Definitions bundle before the bundler starts a new one.
pub const MAX_DEFINITIONS_ROWS: usize = 50_000;
/// Weighted rows per Content bundle.
pub const MAX_CONTENT_ROWS: usize = 250_000;
/// Hashes per single mapping row; larger tags are split across rows.
pub const MAX_MAPPING_ROW_HASHES: usize = 25_000;

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

#[derive(Debug, Snafu)]
pub enum BundleDecodeError {
    #[snafu(display("Malformed bundle bytes"))]
    Malformed { source: bincode::error::DecodeError },
    #[snafu(display("Trailing bytes after bundle payload"))]
    TrailingBytes,
}

pub type BundleDecodeResult<T> = std::result::Result<T, BundleDecodeError>;

/// New `(id, value)` definitions published by a service in one window.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefinitionsUpdate {
    pub hashes: Vec<(ServiceHashId, FileHash)>,
    pub tags: Vec<(ServiceTagId, Tag)>,
}

impl DefinitionsUpdate {
    pub fn num_rows(&self) -> usize {
        self.hashes.len() + self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }
}

/// A run of hashes attached to one tag, for mapping add/delete rows.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MappingRows {
    pub tag_id: ServiceTagId,
    pub hash_ids: Vec<ServiceHashId>,
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagParentRow {
    pub child_id: ServiceTagId,
    pub parent_id: ServiceTagId,
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagSiblingRow {
    pub bad_id: ServiceTagId,
    pub good_id: ServiceTagId,
}

/// A committed file row as published to clients.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRow {
    pub hash_id: ServiceHashId,
    pub size: u64,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
    pub num_frames: Option<u32>,
    pub num_words: Option<u32>,
}

impl FileRow {
    pub fn from_info(hash_id: ServiceHashId, info: &FileInfo) -> Self {
        Self {
            hash_id,
            size: info.size,
            mime: info.mime.clone(),
            width: info.width,
            height: info.height,
            duration_ms: info.duration_ms,
            num_frames: info.num_frames,
            num_words: info.num_words,
        }
    }
}

/// Committed add/delete rows for one window, all content kinds.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentUpdate {
    pub file_adds: Vec<FileRow>,
    pub file_deletes: Vec<ServiceHashId>,
    pub mapping_adds: Vec<MappingRows>,
    pub mapping_deletes: Vec<MappingRows>,
    pub parent_adds: Vec<TagParentRow>,
    pub parent_deletes: Vec<TagParentRow>,
    pub sibling_adds: Vec<TagSiblingRow>,
    pub sibling_deletes: Vec<TagSiblingRow>,
}

impl ContentUpdate {
    /// Weighted row count; a mapping row weighs as many rows as it has
    /// hashes.
    pub fn num_rows(&self) -> usize {
        self.file_adds.len()
            + self.file_deletes.len()
            + self
                .mapping_adds
                .iter()
                .chain(self.mapping_deletes.iter())
                .map(|m| m.hash_ids.len())
                .sum::<usize>()
            + self.parent_adds.len()
            + self.parent_deletes.len()
            + self.sibling_adds.len()
            + self.sibling_deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }
}

/// An immutable, content-addressed update blob.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum UpdateBundle {
    DefinitionsV0(DefinitionsUpdate),
    ContentV0(ContentUpdate),
}

impl UpdateBundle {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::encode_to_vec(self, BINCODE_CONFIG).expect("Bundle encoding can't fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> BundleDecodeResult<Self> {
        let (bundle, consumed) =
            bincode::decode_from_slice(bytes, BINCODE_CONFIG).context(MalformedSnafu)?;
        if consumed != bytes.len() {
            return Err(BundleDecodeError::TrailingBytes);
        }
        Ok(bundle)
    }

    /// The bundle's identity: digest of its serialized bytes.
    pub fn compute_hash(&self) -> UpdateHash {
        UpdateHash::digest_of(&self.to_bytes())
    }

    pub fn num_rows(&self) -> usize {
        match self {
            UpdateBundle::DefinitionsV0(d) => d.num_rows(),
            UpdateBundle::ContentV0(c) => c.num_rows(),
        }
    }
}

/// One entry of a client submission.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClientUpdateEntry {
    pub action: ClientAction,
    pub content: ClientContent,
    /// Required for petitions, optional for pends.
    pub reason: Option<String>,
}

/// A client→server submission, applied atomically.
#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
pub enum ClientUpdate {
    #[default]
    Empty,
    V0 {
        entries: Vec<ClientUpdateEntry>,
    },
}

impl ClientUpdate {
    pub fn new(entries: Vec<ClientUpdateEntry>) -> Self {
        if entries.is_empty() {
            ClientUpdate::Empty
        } else {
            ClientUpdate::V0 { entries }
        }
    }

    pub fn entries(&self) -> &[ClientUpdateEntry] {
        match self {
            ClientUpdate::Empty => &[],
            ClientUpdate::V0 { entries } => entries,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::encode_to_vec(self, BINCODE_CONFIG).expect("Submission encoding can't fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> BundleDecodeResult<Self> {
        let (update, consumed) =
            bincode::decode_from_slice(bytes, BINCODE_CONFIG).context(MalformedSnafu)?;
        if consumed != bytes.len() {
            return Err(BundleDecodeError::TrailingBytes);
        }
        Ok(update)
    }
}

/// Whether a petition asks to add or to remove content.
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
pub enum PetitionStatus {
    /// A pending addition.
    Pending,
    /// A removal awaiting moderation.
    Petitioned,
}

/// The summary line for one `(account, reason)` petition.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PetitionHeader {
    pub content_kind: ContentKind,
    pub status: PetitionStatus,
    pub account_key: AccountKey,
    pub reason: String,
}

/// A fully materialized petition, ready for a moderator.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug)]
pub struct Petition {
    pub header: PetitionHeader,
    pub account: crate::account::AccountView,
    pub actions: Vec<(ClientAction, Vec<ClientContent>)>,
    /// True when caps (row/tag/time) cut the content list short.
    pub truncated: bool,
}

/// One entry of a service's update index.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateMetadataEntry {
    pub update_index: u64,
    pub update_hashes: Vec<UpdateHash>,
    pub begin: Timestamp,
    pub end: Timestamp,
}

/// The per-service update index served to clients.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateMetadata {
    pub entries: Vec<UpdateMetadataEntry>,
    pub next_update_due: Timestamp,
}

impl UpdateMetadata {
    /// The tail of the index starting at `from_update_index`.
    pub fn slice_from(&self, from_update_index: u64) -> UpdateMetadata {
        UpdateMetadata {
            entries: self
                .entries
                .iter()
                .filter(|e| from_update_index <= e.update_index)
                .cloned()
                .collect(),
            next_update_due: self.next_update_due,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_bytes_roundtrip_and_digest() {
        let bundle = UpdateBundle::DefinitionsV0(DefinitionsUpdate {
            hashes: vec![(ServiceHashId::new(1), FileHash::from_bytes([3u8; 32]))],
            tags: vec![(
                ServiceTagId::new(1),
                Tag::new("series:some show").expect("valid"),
            )],
        });

        let bytes = bundle.to_bytes();
        let decoded = UpdateBundle::from_bytes(&bytes).expect("roundtrip");
        assert_eq!(decoded, bundle);
        assert_eq!(bundle.compute_hash(), UpdateHash::digest_of(&bytes));
    }

    #[test]
    fn bundle_rejects_trailing_bytes() {
        let bundle = UpdateBundle::ContentV0(ContentUpdate::default());
        let mut bytes = bundle.to_bytes();
        bytes.push(0);
        assert!(matches!(
            UpdateBundle::from_bytes(&bytes),
            Err(BundleDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn content_rows_weigh_mapping_hashes() {
        let update = ContentUpdate {
            mapping_adds: vec![MappingRows {
                tag_id: ServiceTagId::new(1),
                hash_ids: vec![ServiceHashId::new(1), ServiceHashId::new(2)],
            }],
            file_deletes: vec![ServiceHashId::new(9)],
            ..Default::default()
        };
        assert_eq!(update.num_rows(), 3);
    }

    #[test]
    fn metadata_slice_from_index() {
        let entry = |i: u64| UpdateMetadataEntry {
            update_index: i,
            update_hashes: vec![],
            begin: Timestamp::from_secs(i * 100),
            end: Timestamp::from_secs((i + 1) * 100),
        };
        let metadata = UpdateMetadata {
            entries: vec![entry(0), entry(1), entry(2)],
            next_update_due: Timestamp::from_secs(400),
        };

        let slice = metadata.slice_from(1);
        assert_eq!(
            slice.entries.iter().map(|e| e.update_index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(slice.next_update_due, metadata.next_update_due);
    }
}
