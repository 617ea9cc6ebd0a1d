//! Checksum verification over a container's payload sections.
//!
//! Verification walks every checksummed section once, recomputes the
//! chunked hashes, and keeps going past failures so the report covers the
//! whole file.

use tracing::debug;

use vassago_core::checksum;
use vassago_core::{Error, Result};

use crate::container::{Reader, SectionType};
use crate::meta::Meta;

/// Outcome for one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionStatus {
    /// All chunks matched.
    Ok { chunks: usize },
    /// META has no checksum entry for this section.
    MissingIndex,
    /// Chunk counts disagree.
    CountMismatch { have: usize, want: usize },
    /// First mismatching chunk.
    ChunkMismatch { chunk: usize },
    /// The section could not be read or its index entry is malformed.
    ReadError(String),
}

/// Per-section verification result.
#[derive(Debug, Clone)]
pub struct SectionReport {
    pub section: SectionType,
    pub status: SectionStatus,
}

impl SectionReport {
    /// The failure as an error value, for callers that propagate instead
    /// of reporting. Mismatches map to the integrity kind and stay
    /// non-fatal to the verify walk itself.
    #[must_use]
    pub fn to_error(&self) -> Option<Error> {
        match &self.status {
            SectionStatus::Ok { .. } => None,
            SectionStatus::ChunkMismatch { chunk } => Some(Error::Integrity {
                section: self.section.id(),
                chunk: *chunk,
            }),
            SectionStatus::CountMismatch { have, want } => Some(Error::Integrity {
                section: self.section.id(),
                chunk: (*have).min(*want),
            }),
            SectionStatus::MissingIndex => Some(Error::not_found(format!(
                "checksum entry for section {}",
                self.section.id()
            ))),
            SectionStatus::ReadError(e) => Some(Error::format(e.clone())),
        }
    }
}

/// Whole-container verification result.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// False when META carries no checksum index at all.
    pub has_index: bool,
    pub sections: Vec<SectionReport>,
}

impl VerifyReport {
    /// True when the index exists and every section matched.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.has_index
            && self
                .sections
                .iter()
                .all(|s| matches!(s.status, SectionStatus::Ok { .. }))
    }
}

/// Verify every checksummed section of an open container.
pub fn verify_container(reader: &Reader) -> Result<VerifyReport> {
    let meta = Meta::parse(&reader.section_uncompressed(SectionType::Meta)?)?;
    let has_index = !meta.checksum_index.is_empty();

    let mut sections = Vec::new();
    for ty in SectionType::CHECKSUMMED {
        let status = section_status(reader, &meta, ty);
        debug!(section = ty.id(), ?status, "verified");
        sections.push(SectionReport { section: ty, status });
    }
    Ok(VerifyReport { has_index, sections })
}

fn section_status(reader: &Reader, meta: &Meta, ty: SectionType) -> SectionStatus {
    let Some(entry) = meta.checksum_for(ty) else {
        return SectionStatus::MissingIndex;
    };
    if entry.chunk_size == 0 {
        return SectionStatus::ReadError("zero chunk size in index".into());
    }
    let want = match entry.hashes() {
        Ok(w) => w,
        Err(e) => return SectionStatus::ReadError(e.to_string()),
    };
    let data = match reader.section_uncompressed(ty) {
        Ok(d) => d,
        Err(e) => return SectionStatus::ReadError(e.to_string()),
    };
    let have = checksum::chunk_hashes(&data, entry.chunk_size);
    if have.len() != want.len() {
        return SectionStatus::CountMismatch {
            have: have.len(),
            want: want.len(),
        };
    }
    match checksum::first_mismatch(&have, &want) {
        None => SectionStatus::Ok { chunks: have.len() },
        Some(chunk) => SectionStatus::ChunkMismatch { chunk },
    }
}
