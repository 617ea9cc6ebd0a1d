//! Conversion pipeline: legacy tensor container → CAWSF.
//!
//! Every 2-D tensor becomes one scope, assigned densely in lexicographic
//! name order. Per scope the decomposer emits L, D, R, S; the codebook
//! rewrite then pools the R codebooks, the routing table is derived from
//! the final bank, and the checksum index covers every payload section.

use std::path::Path;

use tracing::{debug, info};

use vassago_core::checksum::DEFAULT_CHUNK_SIZE;
use vassago_core::Result;

use crate::codebook;
use crate::container::{SectionType, Writer, FLAG_COMP_LZ4, FLAG_COMP_ZSTD};
use crate::decompose::{decompose, DecomposeConfig};
use crate::meta::{LayerEntry, Meta};
use crate::router;
use crate::safetensors::SafetensorsFile;
use crate::shard;

/// Conversion options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    pub decompose: DecomposeConfig,
    /// Process only the first N 2-D tensors (0 = all).
    pub max_layers: usize,
    /// Skip 2-D tensors with more than N elements (0 = no limit).
    pub max_elems: usize,
}

/// One dense input layer.
#[derive(Debug, Clone)]
pub struct LayerTensor {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

/// What a conversion produced.
#[derive(Debug, Clone, Copy)]
pub struct ConvertSummary {
    pub layers: usize,
    pub shards: usize,
    pub bank_bytes: usize,
    pub codebooks: usize,
}

/// Decompose `layers` and write a complete container to `out`.
///
/// Scope ids are assigned `0..layers.len()` in input order; callers that
/// need determinism sort beforehand.
pub fn build_container(
    layers: Vec<LayerTensor>,
    mut meta: Meta,
    cfg: &DecomposeConfig,
    out: impl AsRef<Path>,
) -> Result<ConvertSummary> {
    let mut blobs: Vec<Vec<u8>> = Vec::new();
    for (scope, layer) in layers.iter().enumerate() {
        let scope = scope as u16;
        let shards = decompose(layer.rows, layer.cols, &layer.data, cfg)?;
        for (ty, payload) in &shards {
            blobs.push(shard::frame(*ty, scope, payload));
        }
        meta.layers.push(LayerEntry {
            scope_id: scope,
            name: layer.name.clone(),
            shape: [layer.rows, layer.cols],
        });
        debug!(scope, name = %layer.name, rows = layer.rows, cols = layer.cols, "layer decomposed");
    }

    let (blobs, codebooks) = codebook::share_codebooks(blobs);
    let shards = blobs.len();
    let bank: Vec<u8> = blobs.concat();
    let routing = router::build_from_bank(&bank)?;

    meta.set_checksum(SectionType::Codebooks, &codebooks, DEFAULT_CHUNK_SIZE);
    meta.set_checksum(SectionType::ShardBank, &bank, DEFAULT_CHUNK_SIZE);
    meta.set_checksum(SectionType::Routing, &routing, DEFAULT_CHUNK_SIZE);

    let summary = ConvertSummary {
        layers: meta.layers.len(),
        shards,
        bank_bytes: bank.len(),
        codebooks: codebooks.len(),
    };

    let mut writer = Writer::new();
    writer.add_section(SectionType::Meta, meta.to_bytes()?, 0);
    // codebooks compress well; the bank favors fast decode
    writer.add_section(SectionType::Codebooks, codebooks, FLAG_COMP_ZSTD);
    writer.add_section(SectionType::ShardBank, bank, FLAG_COMP_LZ4);
    writer.add_section(SectionType::Routing, routing, 0);
    writer.write(out.as_ref())?;

    info!(
        layers = summary.layers,
        shards = summary.shards,
        bank_bytes = summary.bank_bytes,
        out = %out.as_ref().display(),
        "container written"
    );
    Ok(summary)
}

/// Convert a legacy tensor container on disk.
///
/// Only 2-D tensors decompose; everything else is skipped. Tensor
/// iteration is lexicographic by name, which fixes the scope assignment.
/// Model sidecar files next to the input (`tokenizer.json`,
/// `config.json`, `tokenizer_config.json`) are captured into META when
/// present.
pub fn convert_model(
    model: impl AsRef<Path>,
    out: impl AsRef<Path>,
    opts: &ConvertOptions,
) -> Result<ConvertSummary> {
    let model = model.as_ref();
    let st = SafetensorsFile::open(model)?;

    let mut meta = Meta::default();
    meta.model_name = model
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    attach_sidecars(&mut meta, model);

    let mut layers = Vec::new();
    for entry in st.tensors() {
        if !entry.is_2d() {
            continue;
        }
        let (rows, cols) = (entry.shape[0], entry.shape[1]);
        if opts.max_elems > 0 && rows * cols > opts.max_elems {
            debug!(name = %entry.name, elems = rows * cols, "skipped oversized tensor");
            continue;
        }
        if opts.max_layers > 0 && layers.len() >= opts.max_layers {
            break;
        }
        layers.push(LayerTensor {
            name: entry.name.clone(),
            rows,
            cols,
            data: st.tensor_f32(&entry.name)?,
        });
    }
    info!(tensors = st.tensor_count(), selected = layers.len(), "model scanned");

    build_container(layers, meta, &opts.decompose, out)
}

/// Pull tokenizer and config sidecars from the model directory into META.
fn attach_sidecars(meta: &mut Meta, model: &Path) {
    let dir = model.parent().unwrap_or_else(|| Path::new("."));
    meta.tokenizer = Some(
        if std::fs::metadata(dir.join("tokenizer.json")).map(|m| m.len() > 0).unwrap_or(false) {
            "local".to_string()
        } else {
            "gpt2".to_string()
        },
    );
    if let Ok(bytes) = std::fs::read(dir.join("config.json")) {
        if let Ok(v) = serde_json::from_slice(&bytes) {
            meta.hf_config = Some(v);
        }
    }
    if let Ok(bytes) = std::fs::read(dir.join("tokenizer_config.json")) {
        if let Ok(v) = serde_json::from_slice(&bytes) {
            meta.hf_tokenizer_config = Some(v);
        }
    }
}
