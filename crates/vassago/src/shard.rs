//! Framed shards and the shard bank.
//!
//! A shard is one component of one scope's weight matrix, framed by a
//! 12-byte header. The shard bank is the plain concatenation of framed
//! shards; random access goes through an index built in a single linear
//! pass.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ type:u8  scope:u16  comp:u8  usize:u32  csize:u32    │ 12-byte frame
//! ├──────────────────────────────────────────────────────┤
//! │ payload (csize bytes, compressed when comp != 0)     │
//! └──────────────────────────────────────────────────────┘
//! ```

use vassago_core::fp16;
use vassago_core::{Error, Result};

use crate::codec;

/// Per-shard compression code: raw payload.
pub const COMP_RAW: u8 = 0;
/// Per-shard compression code: Zstandard frame.
pub const COMP_ZSTD: u8 = 1;
/// Per-shard compression code: LZ4 frame.
pub const COMP_LZ4: u8 = 2;

/// Shard component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShardType {
    /// Low-rank factor, dense fp16.
    LowRank = 0,
    /// Product-quantized residual.
    Residual = 1,
    /// Sparse outliers.
    Outliers = 2,
    /// Diagonal of the residual, dense fp16 with only the main diagonal set.
    Diagonal = 3,
}

impl TryFrom<u8> for ShardType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ShardType::LowRank),
            1 => Ok(ShardType::Residual),
            2 => Ok(ShardType::Outliers),
            3 => Ok(ShardType::Diagonal),
            _ => Err(Error::format(format!("unknown shard type: {value}"))),
        }
    }
}

/// 12-byte shard frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub shard_type: ShardType,
    pub scope: u16,
    /// Compression code for the payload (0 = raw).
    pub comp: u8,
    /// Uncompressed payload length.
    pub uncompressed_size: u32,
    /// Stored payload length (equals `uncompressed_size` when raw).
    pub stored_size: u32,
}

impl ShardHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.shard_type as u8;
        buf[1..3].copy_from_slice(&self.scope.to_le_bytes());
        buf[3] = self.comp;
        buf[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.stored_size.to_le_bytes());
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Result<Self> {
        Ok(Self {
            shard_type: ShardType::try_from(buf[0])?,
            scope: u16::from_le_bytes([buf[1], buf[2]]),
            comp: buf[3],
            uncompressed_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            stored_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// One indexed shard: payload offset within the bank plus its header.
#[derive(Debug, Clone, Copy)]
pub struct BankRecord {
    /// Offset of the payload (just past the frame header).
    pub offset: usize,
    pub header: ShardHeader,
}

impl BankRecord {
    /// The payload bytes of this record within `bank`.
    #[must_use]
    pub fn payload<'a>(&self, bank: &'a [u8]) -> &'a [u8] {
        &bank[self.offset..self.offset + self.header.stored_size as usize]
    }
}

/// Index the shard bank in one linear pass.
///
/// A record whose declared size runs past the end of the bank terminates
/// the scan: a truncated tail yields the records before it. Frames with an
/// unknown type byte abort with a format error.
pub fn index_bank(bank: &[u8]) -> Result<Vec<BankRecord>> {
    let mut records = Vec::new();
    let mut off = 0;
    while off + ShardHeader::SIZE <= bank.len() {
        let header = ShardHeader::from_bytes(
            bank[off..off + ShardHeader::SIZE].try_into().unwrap(),
        )?;
        off += ShardHeader::SIZE;
        if off + header.stored_size as usize > bank.len() {
            break;
        }
        records.push(BankRecord { offset: off, header });
        off += header.stored_size as usize;
    }
    Ok(records)
}

/// Frame a raw payload with a shard header.
pub fn frame(shard_type: ShardType, scope: u16, payload: &[u8]) -> Vec<u8> {
    let header = ShardHeader {
        shard_type,
        scope,
        comp: COMP_RAW,
        uncompressed_size: payload.len() as u32,
        stored_size: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(ShardHeader::SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decompress a shard payload according to its compression code.
pub fn decompress_payload(comp: u8, data: &[u8]) -> Result<Vec<u8>> {
    match comp {
        COMP_RAW => Ok(data.to_vec()),
        COMP_ZSTD => codec::zstd_decode(data),
        COMP_LZ4 => codec::lz4_decode(data),
        _ => Err(Error::format(format!("unknown shard compression code: {comp}"))),
    }
}

// ==================== L / D payloads ====================

/// Encode an fp16 matrix payload: `rows:u32, cols:u32, fp16[rows*cols]`.
pub fn encode_fp16_matrix(rows: usize, cols: usize, data: &[f32]) -> Vec<u8> {
    debug_assert_eq!(data.len(), rows * cols);
    let mut out = Vec::with_capacity(8 + data.len() * 2);
    out.extend_from_slice(&(rows as u32).to_le_bytes());
    out.extend_from_slice(&(cols as u32).to_le_bytes());
    out.extend_from_slice(&fp16::encode_slice(data));
    out
}

/// Decode an fp16 matrix payload to `(rows, cols, f32 data)`.
pub fn decode_fp16_matrix(payload: &[u8]) -> Result<(usize, usize, Vec<f32>)> {
    let (rows, cols) = read_shape(payload)?;
    let need = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(2))
        .ok_or_else(|| Error::format(format!("fp16 shape overflow: {rows}x{cols}")))?;
    if payload.len() < 8 + need {
        return Err(Error::format(format!(
            "short fp16 data: need {need} bytes, have {}",
            payload.len() - 8
        )));
    }
    Ok((rows, cols, fp16::decode_slice(&payload[8..8 + need])))
}

/// Read the leading `(rows, cols)` pair shared by every payload type.
pub fn read_shape(payload: &[u8]) -> Result<(usize, usize)> {
    if payload.len() < 8 {
        return Err(Error::format("short payload: missing shape"));
    }
    let rows = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let cols = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
    Ok((rows, cols))
}

// ==================== R payload ====================

/// Codebook source of a residual shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodebookRef<'a> {
    /// Codebook bytes embedded in the payload: `m*k*(d/m)` LE f32 values
    /// laid out `[subvector][centroid][sub-dimension]`.
    Embedded(&'a [u8]),
    /// Reference into the shared codebook pool.
    Shared(u16),
}

/// Parsed residual (R) payload.
#[derive(Debug, Clone)]
pub struct ResidualPayload<'a> {
    pub rows: usize,
    pub cols: usize,
    /// Block length.
    pub d: usize,
    /// Sub-quantizer count.
    pub m: usize,
    /// Centroids per sub-quantizer.
    pub k: usize,
    /// Block count.
    pub n: usize,
    pub codebook: CodebookRef<'a>,
    /// `n * m` code bytes.
    pub codes: &'a [u8],
}

impl ResidualPayload<'_> {
    /// Sub-vector length `d / m`.
    #[must_use]
    pub fn dsub(&self) -> usize {
        self.d / self.m
    }

    /// Decode embedded codebook bytes to f32, flat `[m][k][dsub]`.
    pub fn embedded_centroids(&self) -> Option<Vec<f32>> {
        match self.codebook {
            CodebookRef::Embedded(bytes) => Some(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ),
            CodebookRef::Shared(_) => None,
        }
    }
}

/// Parse a residual payload.
///
/// The two layouts share an 18-byte head `rows:u32, cols:u32, d:u16,
/// m:u16, k:u16, n:u32`. A payload whose remaining length past a `cb_id`
/// field is exactly `n*m` uses the shared-codebook layout; anything else
/// must carry embedded codebook bytes followed by exactly `n*m` codes.
pub fn parse_residual(payload: &[u8]) -> Result<ResidualPayload<'_>> {
    if payload.len() < 18 {
        return Err(Error::format("short R payload"));
    }
    let (rows, cols) = read_shape(payload)?;
    let d = u16::from_le_bytes(payload[8..10].try_into().unwrap()) as usize;
    let m = u16::from_le_bytes(payload[10..12].try_into().unwrap()) as usize;
    let k = u16::from_le_bytes(payload[12..14].try_into().unwrap()) as usize;
    let n = u32::from_le_bytes(payload[14..18].try_into().unwrap()) as usize;
    if m == 0 || d % m != 0 {
        return Err(Error::shape(format!(
            "R block length {d} not divisible by sub-quantizer count {m}"
        )));
    }
    let dsub = d / m;

    if payload.len() >= 20 && payload.len() - 20 == n * m {
        let cb_id = u16::from_le_bytes(payload[18..20].try_into().unwrap());
        return Ok(ResidualPayload {
            rows,
            cols,
            d,
            m,
            k,
            n,
            codebook: CodebookRef::Shared(cb_id),
            codes: &payload[20..],
        });
    }

    let cb_size = m * k * dsub * 4;
    if 18 + cb_size > payload.len() {
        return Err(Error::format("short R codebooks"));
    }
    let codes = &payload[18 + cb_size..];
    if codes.len() != n * m {
        return Err(Error::format(format!(
            "R codes size mismatch: have {}, want {}",
            codes.len(),
            n * m
        )));
    }
    Ok(ResidualPayload {
        rows,
        cols,
        d,
        m,
        k,
        n,
        codebook: CodebookRef::Embedded(&payload[18..18 + cb_size]),
        codes,
    })
}

fn residual_head(rows: usize, cols: usize, d: usize, m: usize, k: usize, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(rows as u32).to_le_bytes());
    out.extend_from_slice(&(cols as u32).to_le_bytes());
    out.extend_from_slice(&(d as u16).to_le_bytes());
    out.extend_from_slice(&(m as u16).to_le_bytes());
    out.extend_from_slice(&(k as u16).to_le_bytes());
    out.extend_from_slice(&(n as u32).to_le_bytes());
    out
}

/// Encode a residual payload with embedded codebooks.
///
/// `codebooks` holds one flat `k*dsub` centroid array per sub-quantizer.
pub fn encode_residual_embedded(
    rows: usize,
    cols: usize,
    d: usize,
    m: usize,
    k: usize,
    n: usize,
    codebooks: &[Vec<f32>],
    codes: &[u8],
) -> Vec<u8> {
    debug_assert_eq!(codebooks.len(), m);
    debug_assert_eq!(codes.len(), n * m);
    let mut out = residual_head(rows, cols, d, m, k, n);
    for cb in codebooks {
        for &v in cb {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out.extend_from_slice(codes);
    out
}

/// Encode a residual payload referencing the shared pool.
pub fn encode_residual_shared(
    rows: usize,
    cols: usize,
    d: usize,
    m: usize,
    k: usize,
    n: usize,
    cb_id: u16,
    codes: &[u8],
) -> Vec<u8> {
    debug_assert_eq!(codes.len(), n * m);
    let mut out = residual_head(rows, cols, d, m, k, n);
    out.extend_from_slice(&cb_id.to_le_bytes());
    out.extend_from_slice(codes);
    out
}

// ==================== S payload ====================

/// Parsed sparse (S) payload.
#[derive(Debug, Clone)]
pub struct SparsePayload {
    pub rows: usize,
    pub cols: usize,
    /// `(row, col, value)` triplets in row-major emit order.
    pub entries: Vec<(i32, i32, f32)>,
}

/// Encode a sparse payload: `rows:u32, cols:u32, n:u32, (row:i32,col:i32)*n, f32*n`.
pub fn encode_sparse(rows: usize, cols: usize, entries: &[(i32, i32, f32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + entries.len() * 12);
    out.extend_from_slice(&(rows as u32).to_le_bytes());
    out.extend_from_slice(&(cols as u32).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for &(r, c, _) in entries {
        out.extend_from_slice(&r.to_le_bytes());
        out.extend_from_slice(&c.to_le_bytes());
    }
    for &(_, _, v) in entries {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Parse a sparse payload.
pub fn parse_sparse(payload: &[u8]) -> Result<SparsePayload> {
    if payload.len() < 12 {
        return Err(Error::format("short S payload"));
    }
    let (rows, cols) = read_shape(payload)?;
    let n = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
    let need = 12 + n * 12;
    if payload.len() < need {
        return Err(Error::format(format!(
            "short S payload: need {need} bytes, have {}",
            payload.len()
        )));
    }
    let mut entries = Vec::with_capacity(n);
    let idx_base = 12;
    let val_base = 12 + n * 8;
    for i in 0..n {
        let r = i32::from_le_bytes(payload[idx_base + i * 8..idx_base + i * 8 + 4].try_into().unwrap());
        let c = i32::from_le_bytes(payload[idx_base + i * 8 + 4..idx_base + i * 8 + 8].try_into().unwrap());
        let v = f32::from_le_bytes(payload[val_base + i * 4..val_base + i * 4 + 4].try_into().unwrap());
        entries.push((r, c, v));
    }
    Ok(SparsePayload { rows, cols, entries })
}
