//! META section model.
//!
//! META is a JSON object carrying the layer directory (scope id → tensor
//! name and shape), the per-section checksum index, and whatever model
//! sidecar data the conversion discovered. Unknown keys are preserved for
//! readers that know more than we do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vassago_core::checksum;
use vassago_core::{Error, Result};

use crate::container::SectionType;

/// Checksum algorithm name recorded in META.
pub const CHECKSUM_ALGO: &str = "xxh3-64";

/// One layer directory entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerEntry {
    pub scope_id: u16,
    pub name: String,
    /// `[rows, cols]`.
    pub shape: [usize; 2],
}

/// Chunked checksum record for one section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub algo: String,
    pub chunk_size: usize,
    pub count: usize,
    pub hashes_hex: Vec<String>,
}

impl ChecksumEntry {
    /// Compute the entry for a section's uncompressed bytes.
    pub fn compute(data: &[u8], chunk_size: usize) -> Self {
        let hashes_hex = checksum::chunk_hashes_hex(data, chunk_size);
        Self {
            algo: CHECKSUM_ALGO.to_string(),
            chunk_size,
            count: hashes_hex.len(),
            hashes_hex,
        }
    }

    /// Parse the stored hex digests back to u64 hashes.
    pub fn hashes(&self) -> Result<Vec<u64>> {
        self.hashes_hex
            .iter()
            .map(|s| {
                u64::from_str_radix(s, 16)
                    .map_err(|_| Error::format(format!("bad checksum digest: {s:?}")))
            })
            .collect()
    }
}

/// The META JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub format_version: u32,
    #[serde(default)]
    pub layers: Vec<LayerEntry>,
    /// Section type id (as a decimal string) → checksum record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksum_index: BTreeMap<String, ChecksumEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_tokenizer_config: Option<serde_json::Value>,
    /// Keys this version does not model.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            format_version: 1,
            layers: Vec::new(),
            checksum_index: BTreeMap::new(),
            model_name: None,
            tokenizer: None,
            hf_config: None,
            hf_tokenizer_config: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Meta {
    /// Parse the META section.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::format(format!("META: {e}")))
    }

    /// Serialize to the on-disk JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::format(format!("META: {e}")))
    }

    /// Record a checksum entry for one section.
    pub fn set_checksum(&mut self, section: SectionType, data: &[u8], chunk_size: usize) {
        self.checksum_index.insert(
            section.id().to_string(),
            ChecksumEntry::compute(data, chunk_size),
        );
    }

    /// Look up a section's checksum entry.
    #[must_use]
    pub fn checksum_for(&self, section: SectionType) -> Option<&ChecksumEntry> {
        self.checksum_index.get(&section.id().to_string())
    }

    /// Resolve a scope id to its tensor name.
    #[must_use]
    pub fn layer_name(&self, scope: u16) -> Option<&str> {
        self.layers
            .iter()
            .find(|l| l.scope_id == scope)
            .map(|l| l.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let mut meta = Meta::default();
        meta.layers.push(LayerEntry {
            scope_id: 0,
            name: "model.layers.0.self_attn.q_proj.weight".into(),
            shape: [64, 64],
        });
        meta.set_checksum(SectionType::ShardBank, &[1, 2, 3], 1024);
        meta.model_name = Some("toy".into());

        let bytes = meta.to_bytes().unwrap();
        let back = Meta::parse(&bytes).unwrap();
        assert_eq!(back.format_version, 1);
        assert_eq!(back.layers, meta.layers);
        assert_eq!(back.checksum_for(SectionType::ShardBank).unwrap().count, 1);
        assert_eq!(back.layer_name(0).unwrap(), meta.layers[0].name);
        assert!(back.layer_name(1).is_none());
    }

    #[test]
    fn unknown_keys_survive() {
        let src = br#"{"format_version":1,"layers":[],"custom_field":{"a":1}}"#;
        let meta = Meta::parse(src).unwrap();
        assert!(meta.extra.contains_key("custom_field"));
        let out = meta.to_bytes().unwrap();
        let back = Meta::parse(&out).unwrap();
        assert!(back.extra.contains_key("custom_field"));
    }

    #[test]
    fn digest_parse_rejects_garbage() {
        let entry = ChecksumEntry {
            algo: CHECKSUM_ALGO.into(),
            chunk_size: 1,
            count: 1,
            hashes_hex: vec!["zzzz".into()],
        };
        assert!(entry.hashes().is_err());
        let good = ChecksumEntry::compute(b"abc", 1024);
        assert_eq!(good.hashes().unwrap().len(), 1);
    }
}
