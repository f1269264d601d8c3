//! Content kinds and the rows clients submit about them.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::id::FileHash;
use crate::tag::Tag;

/// The four kinds of repository content.
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
pub enum ContentKind {
    Files,
    Mappings,
    TagParents,
    TagSiblings,
}

impl ContentKind {
    pub const ALL: [ContentKind; 4] = [
        ContentKind::Files,
        ContentKind::Mappings,
        ContentKind::TagParents,
        ContentKind::TagSiblings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Files => "files",
            ContentKind::Mappings => "mappings",
            ContentKind::TagParents => "tag parents",
            ContentKind::TagSiblings => "tag siblings",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a client supplies when uploading a file.
///
/// Width/height/duration/frames/words are absent for media the uploader's
/// client could not parse; the server stores what it is given and never
/// re-derives them.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub hash: FileHash,
    pub size: u64,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
    pub num_frames: Option<u32>,
    pub num_words: Option<u32>,
}

/// One piece of content as a client names it: by hash and tag value, not by
/// service-scoped ids (those exist only once content is committed).
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ClientContent {
    Files { hashes: Vec<FileHash> },
    Mappings { tag: Tag, hashes: Vec<FileHash> },
    TagParent { child: Tag, parent: Tag },
    TagSibling { bad: Tag, good: Tag },
}

impl ClientContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            ClientContent::Files { .. } => ContentKind::Files,
            ClientContent::Mappings { .. } => ContentKind::Mappings,
            ClientContent::TagParent { .. } => ContentKind::TagParents,
            ClientContent::TagSibling { .. } => ContentKind::TagSiblings,
        }
    }

    /// Number of underlying rows, for bandwidth and cap accounting.
    pub fn num_rows(&self) -> usize {
        match self {
            ClientContent::Files { hashes } => hashes.len(),
            ClientContent::Mappings { hashes, .. } => hashes.len(),
            ClientContent::TagParent { .. } | ClientContent::TagSibling { .. } => 1,
        }
    }
}

/// What a client asks the server to do with a piece of content.
///
/// Accounts with `Create` permission get their pends committed immediately;
/// moderators get their petitions executed immediately. Everyone else lands
/// in the pending/petitioned queues.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
pub enum ClientAction {
    /// Request an addition.
    Pend,
    /// Request a removal.
    Petition,
}

impl std::fmt::Display for ClientAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientAction::Pend => "pend",
            ClientAction::Petition => "petition",
        })
    }
}
