//! Legacy tensor container read bridge (safetensors).
//!
//! File layout: `hdr_len:u64 LE`, `hdr_len` bytes of JSON mapping tensor
//! name → `{dtype, shape, data_offsets:[start,end]}`, then the tensor
//! data region. Access is memory-mapped and zero-copy; the OS pages data
//! in on demand.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::Deserialize;

use vassago_core::fp16;
use vassago_core::{Error, Result};

/// Tensor element type in the legacy container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    F32,
    F16,
    Bf16,
    Unknown,
}

impl TensorDtype {
    /// Parse the header's dtype string (both spellings are accepted).
    pub fn from_str(s: &str) -> Self {
        match s {
            "F32" | "float32" => TensorDtype::F32,
            "F16" | "float16" => TensorDtype::F16,
            "BF16" | "bfloat16" => TensorDtype::Bf16,
            _ => TensorDtype::Unknown,
        }
    }
}

/// Metadata for one tensor.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: TensorDtype,
    pub shape: Vec<usize>,
    /// Offset in the data region.
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
}

impl TensorEntry {
    /// Element count.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// True for 2-D weight matrices (the only shape that decomposes).
    #[must_use]
    pub fn is_2d(&self) -> bool {
        self.shape.len() == 2
    }
}

/// Raw header record; `__metadata__` and friends lack the tensor fields.
#[derive(Debug, Deserialize)]
struct RawTensorInfo {
    dtype: Option<String>,
    shape: Option<Vec<usize>>,
    data_offsets: Option<(usize, usize)>,
}

/// Memory-mapped legacy tensor container.
pub struct SafetensorsFile {
    mmap: Mmap,
    /// Entries sorted by name for deterministic scope assignment.
    tensors: Vec<TensorEntry>,
    name_index: HashMap<String, usize>,
    data_offset: usize,
}

impl SafetensorsFile {
    /// Open and parse the header. The file stays mapped for the lifetime
    /// of the value.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 8 {
            return Err(Error::format("file too small for header length"));
        }
        let header_len = u64::from_le_bytes(mmap[0..8].try_into().unwrap()) as usize;
        let header_end = 8usize
            .checked_add(header_len)
            .ok_or_else(|| Error::format("header length overflow"))?;
        if mmap.len() < header_end {
            return Err(Error::format("file truncated before header end"));
        }

        let header_json = std::str::from_utf8(&mmap[8..header_end])
            .map_err(|e| Error::format(format!("invalid UTF-8 in header: {e}")))?;
        let raw: HashMap<String, RawTensorInfo> = serde_json::from_str(header_json)
            .map_err(|e| Error::format(format!("invalid JSON header: {e}")))?;

        let mut tensors: Vec<TensorEntry> = raw
            .into_iter()
            .filter(|(name, _)| name != "__metadata__")
            .filter_map(|(name, info)| {
                let dtype = TensorDtype::from_str(&info.dtype?);
                let shape = info.shape?;
                let (start, end) = info.data_offsets?;
                if end < start {
                    return None;
                }
                Some(TensorEntry {
                    name,
                    dtype,
                    shape,
                    offset: start,
                    size: end - start,
                })
            })
            .collect();
        tensors.sort_by(|a, b| a.name.cmp(&b.name));

        let name_index = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Ok(Self {
            mmap,
            tensors,
            name_index,
            data_offset: header_end,
        })
    }

    /// Number of tensors.
    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Iterate entries in name order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorEntry> {
        self.tensors.iter()
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.name_index.get(name).map(|&i| &self.tensors[i])
    }

    /// Raw tensor bytes (a view into the mapping, no copy).
    pub fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::not_found(format!("tensor {name:?}")))?;
        let start = self.data_offset + entry.offset;
        let end = start + entry.size;
        if end > self.mmap.len() {
            return Err(Error::format(format!(
                "tensor {name:?} extends past end of file"
            )));
        }
        Ok(&self.mmap[start..end])
    }

    /// Decode tensor bytes to f32. Handles F32, F16 and BF16.
    pub fn tensor_f32(&self, name: &str) -> Result<Vec<f32>> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::not_found(format!("tensor {name:?}")))?;
        let bytes = self.tensor_bytes(name)?;
        match entry.dtype {
            TensorDtype::F32 => Ok(bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect()),
            TensorDtype::F16 => Ok(bytes
                .chunks_exact(2)
                .map(|c| fp16::decode(u16::from_le_bytes([c[0], c[1]])))
                .collect()),
            TensorDtype::Bf16 => Ok(bytes
                .chunks_exact(2)
                .map(|c| {
                    let bits = u32::from(u16::from_le_bytes([c[0], c[1]])) << 16;
                    f32::from_bits(bits)
                })
                .collect()),
            TensorDtype::Unknown => Err(Error::format(format!(
                "unsupported dtype for tensor {name:?}"
            ))),
        }
    }
}
