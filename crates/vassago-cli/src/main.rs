//! Thin command-line front-end over the vassago library.
//!
//! Exit codes: 0 success, 1 usage or runtime error, 2 missing checksum
//! index, 3 checksum mismatch.

mod export_gguf;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vassago::accel;
use vassago::container::{Reader, SectionType};
use vassago::convert::{convert_model, ConvertOptions};
use vassago::decompose::DecomposeConfig;
use vassago::gguf;
use vassago::linear::apply_scope;
use vassago::reconstruct::reconstruct_scope;
use vassago::router::{query_key, RoutingTable};
use vassago::verify::{verify_container, SectionStatus};
use vassago::CodebookPool;
use vassago_core::{Error, Result};

#[derive(Parser)]
#[command(name = "vassago", version, about = "Decomposed weight-shard containers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the local model directory
    Init,
    /// List model files in the local model directory
    List,
    /// Download a model file into the local model directory
    Pull { url: String },
    /// Show container or GGUF metadata
    Inspect { file: PathBuf },
    /// Decompose a legacy tensor container into a shard container
    Convert {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 64)]
        rank: usize,
        #[arg(long = "outlier-q", default_value_t = 0.999)]
        outlier_q: f64,
        #[arg(long = "pq-m", default_value_t = 8)]
        pq_m: usize,
        #[arg(long = "pq-k", default_value_t = 256)]
        pq_k: usize,
        #[arg(long = "max-layers", default_value_t = 0)]
        max_layers: usize,
        #[arg(long = "max-elems", default_value_t = 0)]
        max_elems: usize,
    },
    /// Export reconstructed f32 blobs per scope
    Export {
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        scope: Option<u16>,
    },
    /// Export a GGUF file with reconstructed f32 tensors
    ExportGguf {
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "vassago-generic")]
        family: String,
    },
    /// Select shards for a prompt under a cost budget
    Route {
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(short = 'p', long)]
        prompt: String,
        #[arg(short, long, default_value_t = 8)]
        k: usize,
        #[arg(long, default_value_t = 0.0)]
        budget: f64,
    },
    /// Multiply a scope against a deterministic probe vector
    Apply {
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(long)]
        scope: u16,
        #[arg(long)]
        xlen: usize,
    },
    /// Verify section checksums
    Verify {
        #[arg(long = "in")]
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };
    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("vassago: {e}");
            ExitCode::from(1)
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn models_dir() -> PathBuf {
    home_dir().join(".vassago").join("models")
}

fn run(command: Command) -> Result<u8> {
    match command {
        Command::Init => {
            std::fs::create_dir_all(models_dir())?;
            println!("Initialized: {}", home_dir().join(".vassago").display());
            Ok(0)
        }
        Command::List => {
            for entry in std::fs::read_dir(models_dir())? {
                let path = entry?.path();
                if path.is_dir() {
                    continue;
                }
                match path.extension().and_then(|e| e.to_str()) {
                    Some("cawsf") | Some("gguf") => {
                        println!("{}", path.file_name().unwrap().to_string_lossy())
                    }
                    _ => {}
                }
            }
            Ok(0)
        }
        Command::Pull { url } => {
            let name = url.rsplit('/').next().unwrap_or("model.bin");
            let out = models_dir().join(name);
            std::fs::create_dir_all(models_dir())?;
            let resp = reqwest::blocking::get(&url)
                .map_err(|e| Error::format(format!("download {url}: {e}")))?;
            if !resp.status().is_success() {
                return Err(Error::format(format!("http error: {}", resp.status())));
            }
            let bytes = resp
                .bytes()
                .map_err(|e| Error::format(format!("download {url}: {e}")))?;
            std::fs::File::create(&out)?.write_all(&bytes)?;
            println!("Downloaded: {}", out.display());
            Ok(0)
        }
        Command::Inspect { file } => cmd_inspect(&file),
        Command::Convert {
            model,
            out,
            rank,
            outlier_q,
            pq_m,
            pq_k,
            max_layers,
            max_elems,
        } => {
            let opts = ConvertOptions {
                decompose: DecomposeConfig {
                    rank,
                    outlier_quantile: outlier_q,
                    pq_m,
                    pq_k,
                },
                max_layers,
                max_elems,
            };
            convert_model(&model, &out, &opts)?;
            println!("Converted: {}", out.display());
            Ok(0)
        }
        Command::Export { input, out, scope } => cmd_export(&input, &out, scope),
        Command::ExportGguf { input, out, family } => {
            export_gguf::run(&input, &out, &family)?;
            println!("Exported: {}", out.display());
            Ok(0)
        }
        Command::Route {
            input,
            prompt,
            k,
            budget,
        } => cmd_route(&input, &prompt, k, budget),
        Command::Apply { input, scope, xlen } => cmd_apply(&input, scope, xlen),
        Command::Verify { input } => cmd_verify(&input),
    }
}

fn cmd_inspect(file: &Path) -> Result<u8> {
    match file.extension().and_then(|e| e.to_str()) {
        Some("cawsf") => {
            let reader = Reader::open(file)?;
            let meta = reader.section_uncompressed(SectionType::Meta)?;
            match serde_json::from_slice::<serde_json::Value>(&meta) {
                Ok(v) => {
                    println!("META:");
                    println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default());
                    if let Some(idx) = v.get("checksum_index").and_then(|v| v.as_object()) {
                        println!("Checksums:");
                        for (k, m) in idx {
                            println!(
                                "  section {k}: chunks={} algo={}",
                                m.get("count").cloned().unwrap_or_default(),
                                m.get("algo").cloned().unwrap_or_default()
                            );
                        }
                    }
                }
                Err(_) => println!("META: {} bytes (binary)", meta.len()),
            }
            let bank = reader.section(SectionType::ShardBank)?;
            println!("SHARD_BANK: {} bytes", bank.len());
            Ok(0)
        }
        Some("gguf") => {
            let info = gguf::inspect(file)?;
            println!(
                "GGUF: version={} tensors={} kv={}",
                info.version, info.tensor_count, info.kv_count
            );
            Ok(0)
        }
        _ => Err(Error::format("unknown extension (expected .cawsf or .gguf)")),
    }
}

fn open_bank_and_pool(input: &Path) -> Result<(Reader, Vec<u8>, CodebookPool)> {
    let reader = Reader::open(input)?;
    let bank = reader.section_uncompressed(SectionType::ShardBank)?;
    let pool = match reader.section_uncompressed(SectionType::Codebooks) {
        Ok(bytes) => CodebookPool::parse(&bytes)?,
        Err(Error::NotFound { .. }) => CodebookPool::default(),
        Err(e) => return Err(e),
    };
    Ok((reader, bank, pool))
}

fn scopes_in_bank(bank: &[u8]) -> Result<Vec<u16>> {
    let mut scopes: Vec<u16> = vassago::shard::index_bank(bank)?
        .iter()
        .map(|r| r.header.scope)
        .collect();
    scopes.sort_unstable();
    scopes.dedup();
    Ok(scopes)
}

fn cmd_export(input: &Path, out_dir: &Path, only: Option<u16>) -> Result<u8> {
    let (_reader, bank, pool) = open_bank_and_pool(input)?;
    std::fs::create_dir_all(out_dir)?;
    for scope in scopes_in_bank(&bank)? {
        if let Some(want) = only {
            if scope != want {
                continue;
            }
        }
        let (rows, cols, data) = reconstruct_scope(&bank, Some(&pool), scope)?;
        let path = out_dir.join(format!("scope_{scope}_{rows}x{cols}.f32"));
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in &data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes)?;
        println!("wrote {}", path.display());
    }
    Ok(0)
}

fn cmd_route(input: &Path, prompt: &str, k: usize, budget: f64) -> Result<u8> {
    let reader = Reader::open(input)?;
    let table = RoutingTable::parse(&reader.section_uncompressed(SectionType::Routing)?)?;
    let q = query_key(prompt, table.dim());
    let selected = table.select(&q, k, budget);
    println!(
        "Selected {}/{} shards (budget={budget:.2})",
        selected.len(),
        table.len()
    );
    for (i, s) in selected.iter().enumerate() {
        println!("{i:2}: shard_id={} cost={:.3}", s.shard_id, s.cost);
    }
    Ok(0)
}

fn cmd_apply(input: &Path, scope: u16, xlen: usize) -> Result<u8> {
    let (_reader, bank, pool) = open_bank_and_pool(input)?;
    // deterministic probe vector from an FNV-style per-index bit pattern
    let x: Vec<f32> = (0..xlen)
        .map(|i| {
            let bits = 2166136261u32.wrapping_add((i as u32).wrapping_mul(16777619));
            f32::from_bits(bits)
        })
        .collect();
    let backend = accel::env_backend();
    let (y, rows, cols) = apply_scope(&bank, Some(&pool), scope, &x, backend.as_deref())?;
    if cols != xlen {
        println!("warning: xlen={xlen} but cols={cols}");
    }
    println!("y (rows={rows}):");
    for (i, v) in y.iter().take(16).enumerate() {
        println!("  y[{i}]={v:.6}");
    }
    Ok(0)
}

fn cmd_verify(input: &Path) -> Result<u8> {
    let reader = Reader::open(input)?;
    let report = verify_container(&reader)?;
    if !report.has_index {
        println!("no checksum_index in META");
        return Ok(2);
    }
    let mut failed = false;
    for section in &report.sections {
        let id = section.section.id();
        match &section.status {
            SectionStatus::Ok { chunks } => println!("section {id}: ok ({chunks} chunks)"),
            SectionStatus::MissingIndex => {
                println!("missing checksum for section {id}");
                failed = true;
            }
            SectionStatus::CountMismatch { have, want } => {
                println!("section {id}: chunk count mismatch have {have} want {want}");
                failed = true;
            }
            SectionStatus::ChunkMismatch { chunk } => {
                println!("section {id}: chunk {chunk} mismatch");
                failed = true;
            }
            SectionStatus::ReadError(e) => {
                println!("section {id}: read error: {e}");
                failed = true;
            }
        }
    }
    if failed {
        eprintln!("checksum verify: FAILED");
        Ok(3)
    } else {
        println!("checksum verify: OK");
        Ok(0)
    }
}
