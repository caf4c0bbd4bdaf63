use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Represents the version fingerprint of a bundle, as an unsigned 128-bit
/// value.
///
/// Equality of two fingerprints defines "same content". The all-zeroes and
/// all-ones values are reserved sentinels carried by patch documents; see
/// [`BundleVersion`] for how they are interpreted.
#[derive(Copy, Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// The all-zeroes sentinel.
    pub const ZERO: Self = Self([0u8; 16]);

    /// The all-ones sentinel.
    pub const MAX: Self = Self([0xffu8; 16]);

    /// Return a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// Whether this is one of the reserved sentinel values.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::ZERO || *self == Self::MAX
    }

    /// Fingerprint the specified data (128-bit FNV-1a).
    pub fn of(data: &[u8]) -> Self {
        const OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
        const PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

        let mut state = OFFSET_BASIS;
        for byte in data {
            state ^= u128::from(*byte);
            state = state.wrapping_mul(PRIME);
        }
        Self(state.to_be_bytes())
    }
}

impl From<[u8; 16]> for ContentHash {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            let hex = String::deserialize(deserializer)?;
            hex.parse().map_err(D::Error::custom)
        } else {
            Ok(Self(<[u8; 16]>::deserialize(deserializer)?))
        }
    }
}

/// The version against which a bundle is pulled from the store.
///
/// This replaces the historical overloading of the zero/max hash sentinels:
/// `Pinned` versions may short-circuit to locally materialized content, the
/// two other states never do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundleVersion {
    /// No patch was ever restored; the fetch is unconditional.
    NoPatch,
    /// The caller requires a fresh download, bypassing the local cache.
    ForceDownload,
    /// A known fingerprint, eligible for the local short-circuit.
    Pinned(ContentHash),
}

impl BundleVersion {
    /// The fingerprint under which pulled content may be materialized
    /// locally, if any.
    pub fn cache_key(&self) -> Option<&ContentHash> {
        match self {
            Self::Pinned(hash) => Some(hash),
            Self::NoPatch | Self::ForceDownload => None,
        }
    }
}

impl From<ContentHash> for BundleVersion {
    fn from(hash: ContentHash) -> Self {
        if hash.is_sentinel() {
            Self::ForceDownload
        } else {
            Self::Pinned(hash)
        }
    }
}
