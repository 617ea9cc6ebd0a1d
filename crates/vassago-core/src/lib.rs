//! # Vassago Core
//!
//! Foundation crate for the Vassago weight-shard format: error types, the
//! on-disk fp16 codec, and the chunked checksum primitives shared by the
//! container writer and the verifier.
//!
//! Vassago is named after the 3rd demon of the Ars Goetia, who discovers
//! things hidden and lost — as this library recovers dense weight matrices
//! from their scattered shard components.

pub mod checksum;
pub mod error;
pub mod fp16;

pub use checksum::{chunk_hashes, chunk_hashes_hex, DEFAULT_CHUNK_SIZE};
pub use error::{Error, Result};
