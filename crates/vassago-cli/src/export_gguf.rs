//! GGUF export: reconstruct every scope and serialize f32 tensors with
//! family-mapped names and architecture metadata.

use std::path::Path;

use vassago::container::{Reader, SectionType};
use vassago::gguf::{GgufTensor, GgufValue, GgufWriter};
use vassago::meta::Meta;
use vassago::reconstruct::reconstruct_scope;
use vassago::CodebookPool;
use vassago_core::Result;

pub fn run(input: &Path, output: &Path, family: &str) -> Result<()> {
    let reader = Reader::open(input)?;
    let meta = Meta::parse(&reader.section_uncompressed(SectionType::Meta)?)?;
    let bank = reader.section_uncompressed(SectionType::ShardBank)?;
    let pool = match reader.section_uncompressed(SectionType::Codebooks) {
        Ok(bytes) => CodebookPool::parse(&bytes)?,
        Err(_) => CodebookPool::default(),
    };

    let arch = architecture(family, meta.hf_config.as_ref());
    let mut writer = GgufWriter::new();
    writer.add_kv(
        "general.name",
        GgufValue::String(meta.model_name.clone().unwrap_or_else(|| "vassago".into())),
    );
    writer.add_kv("general.file_type", GgufValue::U32(0));
    writer.add_kv("general.architecture", GgufValue::String(arch.clone()));
    add_tokenizer_metadata(&mut writer, &meta);
    if let Some(hf) = meta.hf_config.as_ref() {
        add_arch_metadata(&mut writer, &arch, hf);
    }

    let mut scopes: Vec<u16> = vassago::shard::index_bank(&bank)?
        .iter()
        .map(|r| r.header.scope)
        .collect();
    scopes.sort_unstable();
    scopes.dedup();

    for scope in scopes {
        let (rows, cols, data) = match reconstruct_scope(&bank, Some(&pool), scope) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("scope {scope} error: {e}");
                continue;
            }
        };
        let name = meta
            .layer_name(scope)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("scope_{scope}"));
        writer.add_tensor(GgufTensor {
            name: canonical_tensor_name(&arch, &name),
            dims: vec![rows as u64, cols as u64],
            data,
        });
    }

    writer.write(output)
}

/// Pick the GGUF architecture tag: known HF model types win over the
/// family fallback.
fn architecture(family: &str, hf: Option<&serde_json::Value>) -> String {
    if let Some(mt) = hf
        .and_then(|v| v.get("model_type"))
        .and_then(|v| v.as_str())
    {
        if matches!(mt, "llama" | "mistral" | "qwen2" | "mixtral") {
            return mt.to_string();
        }
    }
    family.to_string()
}

fn add_tokenizer_metadata(writer: &mut GgufWriter, meta: &Meta) {
    if let Some(tcfg) = meta.hf_tokenizer_config.as_ref() {
        for (hf_key, gguf_key) in [
            ("bos_token", "tokenizer.bos_token"),
            ("eos_token", "tokenizer.eos_token"),
            ("unk_token", "tokenizer.unknown_token"),
            ("pad_token", "tokenizer.pad_token"),
        ] {
            if let Some(content) = tcfg
                .get(hf_key)
                .and_then(|v| v.get("content"))
                .and_then(|v| v.as_str())
            {
                writer.add_kv(gguf_key, GgufValue::String(content.to_string()));
            }
        }
    }
    if let Some(hf) = meta.hf_config.as_ref() {
        for (hf_key, gguf_key) in [
            ("bos_token_id", "tokenizer.ggml.bos_token_id"),
            ("eos_token_id", "tokenizer.ggml.eos_token_id"),
        ] {
            if let Some(id) = hf.get(hf_key).and_then(|v| v.as_u64()) {
                writer.add_kv(gguf_key, GgufValue::U32(id as u32));
            }
        }
    }
}

/// Minimal per-architecture KV pairs readers expect.
fn add_arch_metadata(writer: &mut GgufWriter, arch: &str, hf: &serde_json::Value) {
    if !matches!(arch, "llama" | "mistral" | "mixtral" | "qwen2") {
        return;
    }
    let u32_of = |key: &str| hf.get(key).and_then(|v| v.as_u64()).map(|v| v as u32);
    let f32_of = |key: &str| hf.get(key).and_then(|v| v.as_f64()).map(|v| v as f32);

    if let Some(v) = u32_of("vocab_size") {
        writer.add_kv("tokenizer.ggml.tokens", GgufValue::U32(v));
    }
    if let Some(v) = u32_of("hidden_size") {
        writer.add_kv(format!("{arch}.embedding_length"), GgufValue::U32(v));
    }
    if let Some(v) = u32_of("num_hidden_layers") {
        writer.add_kv(format!("{arch}.block_count"), GgufValue::U32(v));
    }
    if let Some(v) = u32_of("num_attention_heads") {
        writer.add_kv(format!("{arch}.attention.head_count"), GgufValue::U32(v));
    }
    if let Some(v) = u32_of("num_key_value_heads") {
        writer.add_kv(format!("{arch}.attention.head_count_kv"), GgufValue::U32(v));
    }
    if let Some(v) = u32_of("max_position_embeddings") {
        writer.add_kv(format!("{arch}.context_length"), GgufValue::U32(v));
    }
    if let Some(v) = f32_of("rms_norm_eps") {
        writer.add_kv(
            format!("{arch}.attention.layer_norm_rms_eps"),
            GgufValue::F32(v),
        );
    }
    if let Some(v) = f32_of("rope_theta") {
        writer.add_kv(format!("{arch}.rope.freq_base"), GgufValue::F32(v));
    }
}

const COMMON_RENAMES: &[(&str, &str)] = &[
    ("model.layers.", "blk."),
    ("input_layernorm.weight", "attn_norm.weight"),
    ("post_attention_layernorm.weight", "ffn_norm.weight"),
    ("self_attn.q_proj.weight", "attn_q.weight"),
    ("self_attn.k_proj.weight", "attn_k.weight"),
    ("self_attn.v_proj.weight", "attn_v.weight"),
    ("self_attn.o_proj.weight", "attn_output.weight"),
    ("mlp.gate_proj.weight", "ffn_gate.weight"),
    ("mlp.up_proj.weight", "ffn_up.weight"),
    ("mlp.down_proj.weight", "ffn_down.weight"),
    ("model.embed_tokens.weight", "token_embd.weight"),
    ("lm_head.weight", "output.weight"),
];

const MIXTRAL_RENAMES: &[(&str, &str)] = &[
    ("model.layers.", "blk."),
    ("input_layernorm.weight", "attn_norm.weight"),
    ("post_attention_layernorm.weight", "ffn_norm.weight"),
    ("mlp.gate.weight", "ffn_router.weight"),
    ("expert_gate.weight", "attn_gate.weight"),
    (".mlp.experts.", ".ffn_experts."),
    (".w1.weight", ".up.weight"),
    (".w3.weight", ".gate.weight"),
    (".w2.weight", ".down.weight"),
    ("self_attn.q_proj.weight", "attn_q.weight"),
    ("self_attn.k_proj.weight", "attn_k.weight"),
    ("self_attn.v_proj.weight", "attn_v.weight"),
    ("self_attn.o_proj.weight", "attn_output.weight"),
];

/// Map a HuggingFace tensor name to the GGUF canonical name for known
/// families; other families keep the name unchanged.
pub fn canonical_tensor_name(arch: &str, name: &str) -> String {
    let table = match arch {
        "llama" | "mistral" | "qwen2" => COMMON_RENAMES,
        "mixtral" => MIXTRAL_RENAMES,
        _ => return name.to_string(),
    };
    let mut s = name.to_string();
    for (from, to) in table {
        s = s.replace(from, to);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_names_canonicalize() {
        assert_eq!(
            canonical_tensor_name("llama", "model.layers.3.self_attn.q_proj.weight"),
            "blk.3.attn_q.weight"
        );
        assert_eq!(
            canonical_tensor_name("llama", "model.embed_tokens.weight"),
            "token_embd.weight"
        );
        assert_eq!(canonical_tensor_name("llama", "lm_head.weight"), "output.weight");
    }

    #[test]
    fn mixtral_expert_names_canonicalize() {
        assert_eq!(
            canonical_tensor_name("mixtral", "model.layers.0.mlp.experts.1.w1.weight"),
            "blk.0.ffn_experts.1.up.weight"
        );
        assert_eq!(
            canonical_tensor_name("mixtral", "model.layers.0.mlp.gate.weight"),
            "blk.0.ffn_router.weight"
        );
    }

    #[test]
    fn unknown_family_keeps_names() {
        assert_eq!(
            canonical_tensor_name("vassago-generic", "model.layers.0.foo"),
            "model.layers.0.foo"
        );
    }

    #[test]
    fn architecture_prefers_known_model_type() {
        let hf = serde_json::json!({"model_type": "llama"});
        assert_eq!(architecture("vassago-generic", Some(&hf)), "llama");
        let hf = serde_json::json!({"model_type": "gptbert"});
        assert_eq!(architecture("vassago-generic", Some(&hf)), "vassago-generic");
        assert_eq!(architecture("vassago-generic", None), "vassago-generic");
    }
}
