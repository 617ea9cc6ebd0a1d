//! # Vassago
//!
//! Decomposed storage and evaluation of transformer weight matrices.
//!
//! Every 2-D weight tensor (a *scope*) is split into four additive
//! components and persisted as framed *shards* in the CAWSF container:
//!
//! - `L` — low-rank factor from a thin SVD, stored in fp16
//! - `D` — the diagonal of the residual, stored in fp16
//! - `R` — product-quantized residual blocks referencing shared codebooks
//! - `S` — sparse outliers above a magnitude quantile
//!
//! From the container Vassago can densely [`reconstruct`] any scope,
//! evaluate `y = W·x` shard-by-shard without materializing `W`
//! ([`linear`]), and select a cost-budgeted subset of shards for a text
//! query ([`router`]).
//!
//! ## Container layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Magic "CAWSF\0\0\0" (8 bytes)                              │
//! │ Header: ver:u32=1, num:u32, reserved:u32 (12 bytes)        │
//! ├────────────────────────────────────────────────────────────┤
//! │ TOC: num × (type:u32, offset:u64, size:u64, flags:u32)     │
//! ├────────────────────────────────────────────────────────────┤
//! │ Section payloads at 4096-aligned offsets                   │
//! │   META=1  CODEBOOKS=2  SHARD_BANK=3  ROUTING=4             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use vassago::container::Reader;
//! use vassago::codebook::CodebookPool;
//! use vassago::reconstruct::reconstruct_scope;
//!
//! let reader = Reader::open("model.cawsf")?;
//! let bank = reader.section_uncompressed(SectionType::ShardBank)?;
//! let pool = CodebookPool::parse(&reader.section_uncompressed(SectionType::Codebooks)?)?;
//! let (rows, cols, dense) = reconstruct_scope(&bank, Some(&pool), 0)?;
//! ```

pub mod accel;
pub mod codebook;
pub mod codec;
pub mod container;
pub mod convert;
pub mod decompose;
pub mod gguf;
pub mod linear;
pub mod meta;
pub mod pq;
pub mod reconstruct;
pub mod router;
pub mod safetensors;
pub mod shard;
pub mod verify;

pub use vassago_core::{Error, Result};

pub use codebook::CodebookPool;
pub use container::{Reader, SectionType, Writer};
pub use decompose::DecomposeConfig;
pub use linear::{apply_scope, DenseMatVec};
pub use meta::Meta;
pub use reconstruct::reconstruct_scope;
pub use router::RoutingTable;
