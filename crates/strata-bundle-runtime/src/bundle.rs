use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    io::Read,
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{Error, Manifest, Result};

/// Case-normalized bundle identifier; the primary key into almost every map
/// in the runtime.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct BundleName(String);

impl BundleName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for BundleName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl<'de> Deserialize<'de> for BundleName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::new(String::deserialize(deserializer)?))
    }
}

const CRC32_ALGO: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_CKSUM);

/// Type tag of a requested asset.
///
/// The 32-bit tag is a CRC-32 of the type name; the name is retained for key
/// formatting.
#[derive(Clone, Debug)]
pub struct AssetType {
    tag: u32,
    name: Cow<'static, str>,
}

impl AssetType {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        Self {
            tag: CRC32_ALGO.checksum(name.as_bytes()),
            name,
        }
    }

    /// The type of a raw content manifest object.
    pub fn manifest() -> Self {
        Self::new("Manifest")
    }

    /// The type of a plain-text wrapper object.
    pub fn plain_text() -> Self {
        Self::new("Text")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Whether decoded objects of this type may enter the runtime cache.
    /// Manifest and plain-text wrapper objects never do.
    pub fn is_cacheable(&self) -> bool {
        *self != Self::manifest() && *self != Self::plain_text()
    }
}

impl PartialEq for AssetType {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for AssetType {}

impl Hash for AssetType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

const BUNDLE_TYPENAME: &[u8; 4] = b"sbdl";
const BUNDLE_VERSION: u16 = 1;

#[derive(Clone, Debug)]
struct BundleEntry {
    asset_type: AssetType,
    data: Arc<[u8]>,
}

/// A decoded bundle: a named, versioned container of packaged assets,
/// fetched as one unit.
///
/// Exactly one live `Bundle` exists per [`BundleName`] at a time; the
/// dependency ledger owns it and consumers only ever receive read-only
/// views of the packed payloads.
#[derive(Clone, Debug, Default)]
pub struct Bundle {
    entries: BTreeMap<String, BundleEntry>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pack an asset payload under `name`.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        asset_type: AssetType,
        data: impl Into<Arc<[u8]>>,
    ) {
        self.entries.insert(
            name.into(),
            BundleEntry {
                asset_type,
                data: data.into(),
            },
        );
    }

    /// The payload packed under `name` with the requested type, if any.
    pub fn get(&self, name: &str, asset_type: &AssetType) -> Option<Arc<[u8]>> {
        self.entries
            .get(name)
            .filter(|entry| entry.asset_type == *asset_type)
            .map(|entry| Arc::clone(&entry.data))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn asset_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a bundle payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidBundle` when the payload is not a valid bundle.
    pub fn decode(name: &BundleName, data: &[u8]) -> Result<Self> {
        Self::decode_inner(data).map_err(|reason| {
            debug!("failed to decode bundle `{name}`: {reason}");
            Error::InvalidBundle(name.clone())
        })
    }

    fn decode_inner(data: &[u8]) -> Result<Self, String> {
        let mut reader = std::io::Cursor::new(data);

        let mut typename = [0u8; 4];
        reader
            .read_exact(&mut typename)
            .map_err(|err| err.to_string())?;
        if &typename != BUNDLE_TYPENAME {
            return Err(format!("unknown payload header {typename:?}"));
        }

        let version = reader
            .read_u16::<LittleEndian>()
            .map_err(|err| err.to_string())?;
        if version != BUNDLE_VERSION {
            return Err(format!("unsupported container version {version}"));
        }

        let entry_count = reader
            .read_u32::<LittleEndian>()
            .map_err(|err| err.to_string())?;

        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let name = read_string(&mut reader)?;
            let type_name = read_string(&mut reader)?;

            let data_len = reader
                .read_u32::<LittleEndian>()
                .map_err(|err| err.to_string())? as usize;
            let mut data = vec![0u8; data_len];
            reader.read_exact(&mut data).map_err(|err| err.to_string())?;

            entries.insert(
                name,
                BundleEntry {
                    asset_type: AssetType::new(type_name),
                    data: data.into(),
                },
            );
        }

        Ok(Self { entries })
    }

    /// Encode this bundle into its container payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_TYPENAME);
        out.write_u16::<LittleEndian>(BUNDLE_VERSION).unwrap();
        out.write_u32::<LittleEndian>(self.entries.len() as u32)
            .unwrap();

        for (name, entry) in &self.entries {
            write_string(&mut out, name);
            write_string(&mut out, entry.asset_type.name());
            out.write_u32::<LittleEndian>(entry.data.len() as u32)
                .unwrap();
            out.extend_from_slice(&entry.data);
        }
        out
    }
}

fn read_string(reader: &mut std::io::Cursor<&[u8]>) -> Result<String, String> {
    let len = reader
        .read_u16::<LittleEndian>()
        .map_err(|err| err.to_string())? as usize;
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|err| err.to_string())?;
    String::from_utf8(bytes).map_err(|err| err.to_string())
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.write_u16::<LittleEndian>(value.len() as u16).unwrap();
    out.extend_from_slice(value.as_bytes());
}

/// A decoded asset object, as stored in the runtime cache.
#[derive(Clone, Debug)]
pub struct AssetObject {
    asset_type: AssetType,
    data: Arc<[u8]>,
}

impl AssetObject {
    pub fn new(asset_type: AssetType, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            asset_type,
            data: data.into(),
        }
    }

    /// Decode a raw payload into an object of the requested type.
    ///
    /// # Errors
    ///
    /// Plain-text objects must be valid UTF-8; other types are opaque.
    pub fn decode(asset_type: AssetType, data: Vec<u8>, origin: &str) -> Result<Self> {
        if asset_type == AssetType::plain_text() && std::str::from_utf8(&data).is_err() {
            return Err(Error::InvalidAsset(
                origin.to_string(),
                "payload is not valid UTF-8 text".to_string(),
            ));
        }
        Ok(Self::new(asset_type, data))
    }

    pub fn asset_type(&self) -> &AssetType {
        &self.asset_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Text view of the payload, when it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Parse the payload as a content manifest.
    ///
    /// # Errors
    ///
    /// Returns `Error::Manifest` when the payload is not a manifest document.
    pub fn as_manifest(&self) -> Result<Manifest> {
        Manifest::from_slice(&self.data)
    }
}
