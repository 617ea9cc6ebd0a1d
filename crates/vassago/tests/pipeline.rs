//! End-to-end pipeline tests: legacy tensor file → container → verify,
//! reconstruct, matvec, route, export.

use std::io::Write;

use vassago::container::{Reader, SectionType};
use vassago::convert::{convert_model, ConvertOptions};
use vassago::gguf::{self, GgufTensor, GgufWriter};
use vassago::linear::apply_scope;
use vassago::meta::Meta;
use vassago::reconstruct::reconstruct_scope;
use vassago::router::{query_key, RoutingTable};
use vassago::verify::verify_container;
use vassago::CodebookPool;

/// Build a small legacy tensor file with two 2-D F32 tensors and a 1-D
/// tensor that must be skipped.
fn write_safetensors(dir: &std::path::Path) -> std::path::PathBuf {
    let a: Vec<f32> = (0..6 * 8).map(|i| ((i as f32) * 0.37).sin() * 0.8).collect();
    let b: Vec<f32> = (0..4 * 4).map(|i| ((i as f32) * 0.91).cos() * 0.3).collect();
    let bias: Vec<f32> = (0..8).map(|i| i as f32).collect();

    let mut data = Vec::new();
    for v in a.iter().chain(&b).chain(&bias) {
        data.extend_from_slice(&v.to_le_bytes());
    }
    let a_end = a.len() * 4;
    let b_end = a_end + b.len() * 4;
    let bias_end = b_end + bias.len() * 4;
    let header = format!(
        concat!(
            r#"{{"alpha.weight":{{"dtype":"F32","shape":[6,8],"data_offsets":[0,{}]}},"#,
            r#""beta.weight":{{"dtype":"F32","shape":[4,4],"data_offsets":[{},{}]}},"#,
            r#""gamma.bias":{{"dtype":"F32","shape":[8],"data_offsets":[{},{}]}}}}"#
        ),
        a_end, a_end, b_end, b_end, bias_end
    );

    let path = dir.join("toy.safetensors");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
    f.write_all(header.as_bytes()).unwrap();
    f.write_all(&data).unwrap();
    path
}

fn convert_toy(dir: &std::path::Path) -> std::path::PathBuf {
    let model = write_safetensors(dir);
    let out = dir.join("toy.cawsf");
    let summary = convert_model(&model, &out, &ConvertOptions::default()).unwrap();
    assert_eq!(summary.layers, 2);
    assert_eq!(summary.shards, 8);
    out
}

#[test]
fn converted_container_verifies_and_reconstructs() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_toy(dir.path());

    let reader = Reader::open(&out).unwrap();
    let report = verify_container(&reader).unwrap();
    assert!(report.passed(), "{report:?}");

    let meta = Meta::parse(&reader.section_uncompressed(SectionType::Meta).unwrap()).unwrap();
    assert_eq!(meta.layers[0].name, "alpha.weight");
    assert_eq!(meta.layers[0].shape, [6, 8]);
    assert_eq!(meta.layers[1].name, "beta.weight");

    let bank = reader.section_uncompressed(SectionType::ShardBank).unwrap();
    let pool =
        CodebookPool::parse(&reader.section_uncompressed(SectionType::Codebooks).unwrap()).unwrap();

    // the default rank covers these small matrices entirely, so the
    // reconstruction should track the input closely
    let original: Vec<f32> = (0..6 * 8).map(|i| ((i as f32) * 0.37).sin() * 0.8).collect();
    let (rows, cols, dense) = reconstruct_scope(&bank, Some(&pool), 0).unwrap();
    assert_eq!((rows, cols), (6, 8));
    for (got, want) in dense.iter().zip(&original) {
        assert!((got - want).abs() < 5e-2, "{got} vs {want}");
    }
}

#[test]
fn matvec_agrees_with_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_toy(dir.path());

    let reader = Reader::open(&out).unwrap();
    let bank = reader.section_uncompressed(SectionType::ShardBank).unwrap();
    let pool =
        CodebookPool::parse(&reader.section_uncompressed(SectionType::Codebooks).unwrap()).unwrap();

    for scope in [0u16, 1] {
        let (rows, cols, w) = reconstruct_scope(&bank, Some(&pool), scope).unwrap();
        let norm = (cols as f32).sqrt();
        let x: Vec<f32> = (0..cols).map(|j| ((j as f32 * 2.3).sin()) / norm).collect();
        let want: Vec<f32> = (0..rows)
            .map(|i| (0..cols).map(|j| w[i * cols + j] * x[j]).sum())
            .collect();
        let (y, r, c) = apply_scope(&bank, Some(&pool), scope, &x, None).unwrap();
        assert_eq!((r, c), (rows, cols));
        for (a, b) in y.iter().zip(&want) {
            assert!((a - b).abs() < 1e-3, "scope {scope}: {a} vs {b}");
        }
    }
}

#[test]
fn routing_covers_the_bank_and_selects_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_toy(dir.path());

    let reader = Reader::open(&out).unwrap();
    let routing = reader.section_uncompressed(SectionType::Routing).unwrap();
    let table = RoutingTable::parse(&routing).unwrap();

    let bank = reader.section_uncompressed(SectionType::ShardBank).unwrap();
    let records = vassago::shard::index_bank(&bank).unwrap();
    assert_eq!(table.len(), records.len());
    let expected: Vec<u32> = (0..records.len() as u32).collect();
    assert_eq!(table.shard_ids(), &expected[..]);

    let q = query_key("attention weights for layer zero", table.dim());
    let first = table.select(&q, 3, 0.0);
    let second = table.select(&q, 3, 0.0);
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

#[test]
fn corruption_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_toy(dir.path());

    let reader = Reader::open(&out).unwrap();
    let entry = *reader
        .toc()
        .iter()
        .find(|e| e.type_id == SectionType::ShardBank.id())
        .unwrap();
    drop(reader);

    let mut bytes = std::fs::read(&out).unwrap();
    let target = entry.offset as usize + (entry.size as usize) / 2;
    bytes[target] ^= 0xff;
    std::fs::write(&out, &bytes).unwrap();

    let reader = Reader::open(&out).unwrap();
    let report = verify_container(&reader).unwrap();
    assert!(!report.passed());
}

#[test]
fn reconstructed_scopes_export_as_gguf() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_toy(dir.path());

    let reader = Reader::open(&out).unwrap();
    let meta = Meta::parse(&reader.section_uncompressed(SectionType::Meta).unwrap()).unwrap();
    let bank = reader.section_uncompressed(SectionType::ShardBank).unwrap();
    let pool =
        CodebookPool::parse(&reader.section_uncompressed(SectionType::Codebooks).unwrap()).unwrap();

    let mut writer = GgufWriter::new();
    writer.add_kv("general.name", gguf::GgufValue::String("toy".into()));
    for layer in &meta.layers {
        let (rows, cols, data) = reconstruct_scope(&bank, Some(&pool), layer.scope_id).unwrap();
        writer.add_tensor(GgufTensor {
            name: layer.name.clone(),
            dims: vec![rows as u64, cols as u64],
            data,
        });
    }
    let gguf_path = dir.path().join("toy.gguf");
    writer.write(&gguf_path).unwrap();

    let info = gguf::inspect(&gguf_path).unwrap();
    assert_eq!(info.version, gguf::GGUF_VERSION);
    assert_eq!(info.tensor_count, 2);
    assert_eq!(info.kv_count, 1);
}

#[test]
fn max_layers_and_max_elems_gate_selection() {
    let dir = tempfile::tempdir().unwrap();
    let model = write_safetensors(dir.path());

    let out = dir.path().join("limited.cawsf");
    let opts = ConvertOptions {
        max_layers: 1,
        ..ConvertOptions::default()
    };
    let summary = convert_model(&model, &out, &opts).unwrap();
    assert_eq!(summary.layers, 1);

    let opts = ConvertOptions {
        max_elems: 20, // only the 4x4 tensor fits
        ..ConvertOptions::default()
    };
    let out2 = dir.path().join("small.cawsf");
    let summary = convert_model(&model, &out2, &opts).unwrap();
    assert_eq!(summary.layers, 1);
    let reader = Reader::open(&out2).unwrap();
    let meta = Meta::parse(&reader.section_uncompressed(SectionType::Meta).unwrap()).unwrap();
    assert_eq!(meta.layers[0].name, "beta.weight");
}
