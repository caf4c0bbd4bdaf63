use serde::{Deserialize, Serialize};
use strata_content_store::{BundleVersion, ContentHash};

use crate::{Error, Result};

/// A named pointer to a specific manifest/content root (a "release").
///
/// Field names follow the wire form of the deployment-side patch document.
/// The commit hash doubles as the version fingerprint of the patch's
/// manifest bundle; sentinel hashes mean the manifest must always be
/// re-downloaded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "commitHash", with = "commit_hash_serde", default)]
    pub commit_hash: ContentHash,
    #[serde(rename = "deployTime", default)]
    pub deploy_time: i64,
}

impl Patch {
    /// The version against which this patch's manifest bundle is pulled.
    pub fn bundle_version(&self) -> BundleVersion {
        BundleVersion::from(self.commit_hash)
    }
}

/// Patch documents carry the commit hash as a string which may be empty;
/// an empty hash reads as the zero sentinel.
mod commit_hash_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use strata_content_store::ContentHash;

    pub fn serialize<S>(hash: &ContentHash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hash.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ContentHash, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(ContentHash::ZERO);
        }
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
struct PatchDocument {
    #[serde(rename = "patchList", default)]
    patch_list: Vec<Patch>,
}

/// The ordered release history, as published by the deployment side.
///
/// Construction filters out entries with a non-positive deploy time and
/// orders the rest newest-first, so the latest patch is always the first
/// entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchHistory {
    patches: Vec<Patch>,
}

impl PatchHistory {
    /// Parse a patch history document: `{ "patchList": [...] }`.
    ///
    /// # Errors
    ///
    /// Returns `Error::PatchDocument` when the document does not parse.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let doc: PatchDocument =
            serde_json::from_slice(data).map_err(|err| Error::PatchDocument(err.to_string()))?;

        let mut patches: Vec<Patch> = doc
            .patch_list
            .into_iter()
            .filter(|patch| patch.deploy_time > 0)
            .collect();
        patches.sort_by(|a, b| b.deploy_time.cmp(&a.deploy_time));

        Ok(Self { patches })
    }

    /// The most recently deployed patch, if any.
    pub fn latest(&self) -> Option<&Patch> {
        self.patches.first()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }
}
