//! Tags and tag normalization.
//!
//! A tag is either `subtag` or `namespace:subtag`. Normalization happens
//! once, at the edge, before master-id lookup; everything past that point
//! holds a [`Tag`] and can assume canonical form.

use std::collections::BTreeSet;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Zero-width and directional-format codepoints that survive `is_control`
/// filtering but must not distinguish two tags.
const FORMAT_CODEPOINTS: &[char] = &[
    '\u{200b}', // zero width space
    '\u{200c}', // zero width non-joiner
    '\u{200d}', // zero width joiner
    '\u{200e}', // left-to-right mark
    '\u{200f}', // right-to-left mark
    '\u{2028}', // line separator
    '\u{2029}', // paragraph separator
    '\u{feff}', // zero width no-break space / BOM
];

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TagError {
    #[snafu(display("Tag is empty after normalization"))]
    Empty,
    #[snafu(display("Tag subtag is empty: `{tag}`"))]
    EmptySubtag { tag: String },
    #[snafu(display("Tag namespace contains a second separator: `{tag}`"))]
    ExtraSeparator { tag: String },
}

pub type TagResult<T> = std::result::Result<T, TagError>;

/// A normalized tag.
#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Tag(String);

impl Tag {
    /// Normalize and validate raw client input.
    ///
    /// Steps: strip control/format codepoints, casefold, collapse internal
    /// whitespace runs to a single space, trim, then validate the
    /// `namespace:subtag` shape. A leading `:` (empty namespace) is
    /// stripped rather than rejected, matching what clients historically
    /// sent.
    pub fn new(raw: &str) -> TagResult<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !c.is_control() && !FORMAT_CODEPOINTS.contains(c))
            .flat_map(|c| c.to_lowercase())
            .collect();

        let mut collapsed = String::with_capacity(cleaned.len());
        let mut last_was_space = true;
        for c in cleaned.chars() {
            if c.is_whitespace() {
                if !last_was_space {
                    collapsed.push(' ');
                }
                last_was_space = true;
            } else {
                collapsed.push(c);
                last_was_space = false;
            }
        }
        let mut tag = collapsed.trim().to_owned();

        if let Some(stripped) = tag.strip_prefix(':') {
            tag = stripped.trim_start().to_owned();
        }

        if tag.is_empty() {
            return Err(TagError::Empty);
        }

        if let Some((namespace, subtag)) = tag.split_once(':') {
            if subtag.contains(':') {
                return Err(TagError::ExtraSeparator { tag });
            }
            if subtag.trim().is_empty() {
                return Err(TagError::EmptySubtag { tag });
            }
            // trim around the separator itself
            tag = format!("{}:{}", namespace.trim_end(), subtag.trim_start());
        }

        Ok(Self(tag))
    }

    /// Wrap a string already known to be canonical (e.g. read back from the
    /// master table).
    pub fn from_canonical(tag: String) -> Self {
        Self(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once(':').map(|(ns, _)| ns)
    }

    pub fn subtag(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(_, st)| st)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}

/// Per-service namespace filter applied on tag ingestion.
///
/// Default-constructed filter accepts everything. A service can restrict to
/// a whitelist of namespaces, block specific namespaces, or both (the block
/// list wins). The empty-string namespace stands for unnamespaced tags.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TagFilter {
    allowed_namespaces: Option<BTreeSet<String>>,
    blocked_namespaces: BTreeSet<String>,
}

impl TagFilter {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn with_allowed(namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_namespaces: Some(namespaces.into_iter().collect()),
            blocked_namespaces: BTreeSet::new(),
        }
    }

    pub fn block(&mut self, namespace: String) {
        self.blocked_namespaces.insert(namespace);
    }

    pub fn allows(&self, tag: &Tag) -> bool {
        let namespace = tag.namespace().unwrap_or("");
        if self.blocked_namespaces.contains(namespace) {
            return false;
        }
        match &self.allowed_namespaces {
            Some(allowed) => allowed.contains(namespace),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(Tag::new("  Blue   SKY ").expect("valid").as_str(), "blue sky");
        assert_eq!(
            Tag::new("Series:Some\u{200b}Name").expect("valid").as_str(),
            "series:somename"
        );
    }

    #[test]
    fn strips_leading_separator() {
        assert_eq!(Tag::new(":lonely").expect("valid").as_str(), "lonely");
    }

    #[test]
    fn rejects_degenerate_tags() {
        assert_eq!(Tag::new("   "), Err(TagError::Empty));
        assert_eq!(Tag::new("\u{200d}\u{feff}"), Err(TagError::Empty));
        assert!(matches!(Tag::new("ns:  "), Err(TagError::EmptySubtag { .. })));
        assert!(matches!(
            Tag::new("a:b:c"),
            Err(TagError::ExtraSeparator { .. })
        ));
    }

    #[test]
    fn namespace_split() {
        let tag = Tag::new("creator:someone").expect("valid");
        assert_eq!(tag.namespace(), Some("creator"));
        assert_eq!(tag.subtag(), "someone");

        let plain = Tag::new("landscape").expect("valid");
        assert_eq!(plain.namespace(), None);
        assert_eq!(plain.subtag(), "landscape");
    }

    #[test]
    fn filter_block_beats_allow() {
        let mut filter = TagFilter::with_allowed(["creator".to_owned(), String::new()]);
        filter.block("creator".to_owned());

        assert!(filter.allows(&Tag::new("plain").expect("valid")));
        assert!(!filter.allows(&Tag::new("creator:x").expect("valid")));
        assert!(!filter.allows(&Tag::new("series:y").expect("valid")));
    }
}
