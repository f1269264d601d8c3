//! Opaque keys, secrets and content digests.
//!
//! Everything here is a fixed 32-byte array behind a newtype. Two display
//! alphabets are in use: secrets and opaque identifiers render as BASE32
//! (compact, case-insensitive to type), while content digests render as
//! lowercase hex because the digest doubles as the on-disk blob filename.

use sha2::{Digest as _, Sha256};
use snafu::Snafu;

use crate::{
    array_type_define, array_type_impl_base32_str, array_type_impl_hex_str,
    array_type_impl_random, array_type_impl_serde,
};

array_type_define!(
    /// Public identifier of a service.
    struct ServiceKey, 32
);
array_type_impl_base32_str!(ServiceKey);
array_type_impl_serde!(struct ServiceKey, 32);
array_type_impl_random!(struct ServiceKey, 32);

array_type_define!(
    /// Public identifier of an account.
    ///
    /// Safe to show to other users (petition headers carry it); holds no
    /// authentication power.
    struct AccountKey, 32
);
array_type_impl_base32_str!(AccountKey);
array_type_impl_serde!(struct AccountKey, 32);
array_type_impl_random!(struct AccountKey, 32);

array_type_define!(
    struct AccountTypeKey, 32
);
array_type_impl_base32_str!(AccountTypeKey);
array_type_impl_serde!(struct AccountTypeKey, 32);
array_type_impl_random!(struct AccountTypeKey, 32);

array_type_define!(
    /// The client-held secret that authenticates an account.
    ///
    /// Only its SHA-256 digest is stored in the accounts table; the raw key
    /// exists server-side only transiently, inside an unredeemed
    /// registration row.
    struct AccessKey, 32
);
array_type_impl_base32_str!(AccessKey);
array_type_impl_serde!(struct AccessKey, 32);
array_type_impl_random!(struct AccessKey, 32);

impl AccessKey {
    pub fn digest(&self) -> AccessKeyDigest {
        AccessKeyDigest(sha256(self.as_slice()))
    }
}

array_type_define!(
    /// SHA-256 of an [`AccessKey`]; the stored credential.
    struct AccessKeyDigest, 32
);
array_type_impl_hex_str!(AccessKeyDigest);
array_type_impl_serde!(struct AccessKeyDigest, 32);

array_type_define!(
    /// One-time key handed out by an admin; redeemable for an access key.
    struct RegistrationKey, 32
);
array_type_impl_base32_str!(RegistrationKey);
array_type_impl_serde!(struct RegistrationKey, 32);
array_type_impl_random!(struct RegistrationKey, 32);

impl RegistrationKey {
    pub fn digest(&self) -> RegistrationKeyDigest {
        RegistrationKeyDigest(sha256(self.as_slice()))
    }
}

array_type_define!(
    /// SHA-256 of a [`RegistrationKey`]; the stored lookup key.
    struct RegistrationKeyDigest, 32
);
array_type_impl_hex_str!(RegistrationKeyDigest);
array_type_impl_serde!(struct RegistrationKeyDigest, 32);

array_type_define!(
    /// Short-lived token binding an HTTP session to an account.
    struct SessionKey, 32
);
array_type_impl_base32_str!(SessionKey);
array_type_impl_serde!(struct SessionKey, 32);
array_type_impl_random!(struct SessionKey, 32);

array_type_define!(
    /// SHA-256 content digest of a file blob.
    struct FileHash, 32
);
array_type_impl_hex_str!(FileHash);
array_type_impl_serde!(struct FileHash, 32);
array_type_impl_random!(struct FileHash, 32);

impl FileHash {
    pub fn digest_of(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }
}

array_type_define!(
    /// SHA-256 digest of a serialized update bundle; its identity.
    struct UpdateHash, 32
);
array_type_impl_hex_str!(UpdateHash);
array_type_impl_serde!(struct UpdateHash, 32);

impl UpdateHash {
    pub fn digest_of(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Digest algorithms recognized in legacy tag archives.
///
/// The wire protocol and blob store only ever use SHA-256. Archives written
/// by other tools may record hashes without naming the algorithm; the byte
/// length then disambiguates, but only when the caller explicitly opts into
/// that inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

#[derive(Debug, Snafu)]
pub enum HashKindError {
    #[snafu(display("Hash length {len} matches no known digest"))]
    UnknownLength { len: usize },
    #[snafu(display("Hash algorithm not recorded and inference not allowed"))]
    InferenceNotAllowed,
}

impl HashKind {
    pub const fn len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
            HashKind::Sha512 => 64,
        }
    }

    /// Guess the algorithm from a raw digest length.
    ///
    /// Refuses unless `allow_inference` is set, so silently mislabeled
    /// archives fail loudly instead of being imported under a guessed
    /// algorithm.
    pub fn infer_from_len(len: usize, allow_inference: bool) -> Result<Self, HashKindError> {
        if !allow_inference {
            return Err(HashKindError::InferenceNotAllowed);
        }
        match len {
            16 => Ok(HashKind::Md5),
            20 => Ok(HashKind::Sha1),
            32 => Ok(HashKind::Sha256),
            64 => Ok(HashKind::Sha512),
            _ => Err(HashKindError::UnknownLength { len }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn access_key_digest_is_stable() {
        let key = AccessKey::from_bytes([7u8; 32]);
        assert_eq!(key.digest(), key.digest());
        assert_ne!(
            key.digest(),
            AccessKey::from_bytes([8u8; 32]).digest(),
            "different keys must not collide"
        );
    }

    #[test]
    fn file_hash_hex_roundtrip() {
        let hash = FileHash::digest_of(b"some bytes");
        let s = hash.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(FileHash::from_str(&s).expect("valid hex"), hash);
    }

    #[test]
    fn session_key_base32_roundtrip() {
        let key = SessionKey::from_bytes([0xab; 32]);
        assert_eq!(
            SessionKey::from_str(&key.to_string()).expect("valid base32"),
            key
        );
    }

    #[test]
    fn hash_kind_inference_requires_opt_in() {
        assert!(matches!(
            HashKind::infer_from_len(20, false),
            Err(HashKindError::InferenceNotAllowed)
        ));
        assert_eq!(
            HashKind::infer_from_len(20, true).expect("known length"),
            HashKind::Sha1
        );
        assert!(matches!(
            HashKind::infer_from_len(21, true),
            Err(HashKindError::UnknownLength { len: 21 })
        ));
    }
}
