#[macro_export]
macro_rules! array_type_define_min_max {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $(#[$outer])*
        pub struct $t([u8; $n]);

        impl $t {
            pub const LEN: usize = $n;

            pub const ZERO: Self = Self([0u8; $n]);
            pub const MAX: Self = Self([0xffu8; $n]);

            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn from_bytes(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(self) -> [u8; $n] {
                self.0
            }
        }

        impl std::fmt::Debug for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }
    }
}

#[macro_export]
macro_rules! array_type_define {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $crate::array_type_define_min_max!(
            #[derive(Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq)]
            #[derive(::bincode::Encode, ::bincode::Decode)]
            $(#[$outer])*
            struct $t, $n
        );
    }
}

/// Random-key constructor for secret/opaque identifier types.
#[macro_export]
macro_rules! array_type_impl_random {
    (
        struct $t:tt, $n:literal
    ) => {
        impl $t {
            pub fn generate() -> Self {
                use ::rand::Rng as _;
                Self(::rand::rng().random::<[u8; $n]>())
            }
        }
    };
}

#[macro_export]
macro_rules! array_type_impl_serde {
    (
        struct $t:tt, $n:literal
    ) => {
        impl ::serde::Serialize for $t {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                if s.is_human_readable() {
                    s.serialize_str(&self.to_string())
                } else {
                    s.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> ::serde::de::Deserialize<'de> for $t {
            fn deserialize<D>(d: D) -> Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                if d.is_human_readable() {
                    let str = <String>::deserialize(d)?;
                    <Self as std::str::FromStr>::from_str(&str).map_err(|e| {
                        ::serde::de::Error::custom(format!("Deserialization error: {e:#}"))
                    })
                } else {
                    let bytes = <Vec<u8>>::deserialize(d)?;
                    let arr: [u8; $n] = bytes.try_into().map_err(|_| {
                        ::serde::de::Error::custom("Deserialization error: wrong length")
                    })?;
                    Ok(Self(arr))
                }
            }
        }
    };
}

#[macro_export]
macro_rules! array_type_impl_base32_str {
    (
        $t:tt
    ) => {
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::BASE32_NOPAD.encode_write(self.as_slice(), f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let v = data_encoding::BASE32_NOPAD.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }
    };
}

/// Hex display, for digests that double as on-disk blob names.
#[macro_export]
macro_rules! array_type_impl_hex_str {
    (
        $t:tt
    ) => {
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::HEXLOWER.encode_write(self.as_slice(), f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let v = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }
    };
}

/// u64-backed identifier newtype, allocated monotonically from a counter.
#[macro_export]
macro_rules! define_integer_id {
    (
        $(#[$outer:meta])*
        struct $t:tt
    ) => {
        $(#[$outer])*
        #[derive(
            Copy, Clone, Hash, Debug, PartialOrd, Ord, PartialEq, Eq,
            ::bincode::Encode, ::bincode::Decode,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        pub struct $t(u64);

        impl $t {
            pub const ZERO: Self = Self(0);
            pub const MAX: Self = Self(u64::MAX);

            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<u64> for $t {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl From<$t> for u64 {
            fn from(v: $t) -> Self {
                v.0
            }
        }
    };
}
