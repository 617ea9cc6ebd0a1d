//! Tensor-delivery write bridge (GGUF v3).
//!
//! A minimal writer sufficient to serialize f32 tensors with typed KV
//! metadata, compatible with GGUF v3 readers. Tensor descriptors are
//! sorted by name and the data region is 32-byte aligned, with each
//! tensor's offset relative to the region start.

use std::io::Write;
use std::path::Path;

use vassago_core::{Error, Result};

/// File magic.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Format version emitted by the writer.
pub const GGUF_VERSION: u32 = 3;

/// Alignment of the tensor data region and of every tensor in it.
pub const DATA_ALIGN: u64 = 32;

/// GGML tensor type id for f32, the only type this writer emits.
pub const GGML_TYPE_F32: u32 = 0;

/// Typed KV value.
#[derive(Debug, Clone)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(u32, Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// Wire type code.
    #[must_use]
    pub fn type_id(&self) -> u32 {
        match self {
            GgufValue::U8(_) => 0,
            GgufValue::I8(_) => 1,
            GgufValue::U16(_) => 2,
            GgufValue::I16(_) => 3,
            GgufValue::U32(_) => 4,
            GgufValue::I32(_) => 5,
            GgufValue::F32(_) => 6,
            GgufValue::Bool(_) => 7,
            GgufValue::String(_) => 8,
            GgufValue::Array(..) => 9,
            GgufValue::U64(_) => 10,
            GgufValue::I64(_) => 11,
            GgufValue::F64(_) => 12,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            GgufValue::U8(v) => out.push(*v),
            GgufValue::I8(v) => out.push(*v as u8),
            GgufValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::Bool(v) => out.push(u8::from(*v)),
            GgufValue::String(s) => write_string(out, s),
            GgufValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            GgufValue::Array(elem_type, values) => {
                out.extend_from_slice(&elem_type.to_le_bytes());
                out.extend_from_slice(&(values.len() as u64).to_le_bytes());
                for v in values {
                    if v.type_id() != *elem_type {
                        return Err(Error::format(format!(
                            "array element type {} does not match declared {elem_type}",
                            v.type_id()
                        )));
                    }
                    v.write_payload(out)?;
                }
            }
        }
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn align_up(x: u64, a: u64) -> u64 {
    let r = x % a;
    if r == 0 {
        x
    } else {
        x + (a - r)
    }
}

/// One tensor to serialize. Data is f32, row-major over `dims`.
#[derive(Debug, Clone)]
pub struct GgufTensor {
    pub name: String,
    pub dims: Vec<u64>,
    pub data: Vec<f32>,
}

/// GGUF buffer builder.
#[derive(Debug, Default)]
pub struct GgufWriter {
    kvs: Vec<(String, GgufValue)>,
    tensors: Vec<GgufTensor>,
}

impl GgufWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a KV pair.
    pub fn add_kv(&mut self, key: impl Into<String>, value: GgufValue) {
        self.kvs.push((key.into(), value));
    }

    /// Append a tensor.
    pub fn add_tensor(&mut self, tensor: GgufTensor) {
        self.tensors.push(tensor);
    }

    /// Write the file to `path`.
    pub fn write(self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = std::fs::File::create(path.as_ref())?;
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Serialize into any sink. Tensors are sorted by name first.
    pub fn write_to(mut self, out: &mut impl Write) -> Result<()> {
        self.tensors.sort_by(|a, b| a.name.cmp(&b.name));

        for t in &self.tensors {
            let expect: u64 = t.dims.iter().product();
            if t.data.len() as u64 != expect {
                return Err(Error::shape(format!(
                    "tensor {:?}: {} values do not fill dims {:?}",
                    t.name,
                    t.data.len(),
                    t.dims
                )));
            }
        }

        // offsets within the 32-aligned data region
        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut cur = 0u64;
        for t in &self.tensors {
            cur = align_up(cur, DATA_ALIGN);
            offsets.push(cur);
            cur += t.data.len() as u64 * 4;
        }

        let mut head = Vec::new();
        head.extend_from_slice(&GGUF_MAGIC);
        head.extend_from_slice(&GGUF_VERSION.to_le_bytes());
        head.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        head.extend_from_slice(&(self.kvs.len() as u64).to_le_bytes());

        for (key, value) in &self.kvs {
            write_string(&mut head, key);
            head.extend_from_slice(&value.type_id().to_le_bytes());
            value.write_payload(&mut head)?;
        }

        for (t, off) in self.tensors.iter().zip(&offsets) {
            write_string(&mut head, &t.name);
            head.extend_from_slice(&(t.dims.len() as u32).to_le_bytes());
            for d in &t.dims {
                head.extend_from_slice(&d.to_le_bytes());
            }
            head.extend_from_slice(&GGML_TYPE_F32.to_le_bytes());
            head.extend_from_slice(&off.to_le_bytes());
        }

        // pad metadata so the data region starts aligned
        let pad = align_up(head.len() as u64, DATA_ALIGN) - head.len() as u64;
        head.extend(std::iter::repeat(0u8).take(pad as usize));
        out.write_all(&head)?;

        let mut pos = 0u64;
        for (t, off) in self.tensors.iter().zip(&offsets) {
            if pos < *off {
                out.write_all(&vec![0u8; (*off - pos) as usize])?;
                pos = *off;
            }
            for v in &t.data {
                out.write_all(&v.to_le_bytes())?;
            }
            pos += t.data.len() as u64 * 4;
        }
        Ok(())
    }
}

/// Header summary of a GGUF file.
#[derive(Debug, Clone, Copy)]
pub struct GgufInfo {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

/// Read the fixed header of a GGUF file.
pub fn inspect(path: impl AsRef<Path>) -> Result<GgufInfo> {
    let bytes = std::fs::read(path.as_ref())?;
    if bytes.len() < 24 {
        return Err(Error::format("file too small for GGUF header"));
    }
    if bytes[0..4] != GGUF_MAGIC {
        return Err(Error::format("not a GGUF file"));
    }
    Ok(GgufInfo {
        version: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        tensor_count: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        kv_count: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // minimal walking reader for round-trip checks
    struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn u32(&mut self) -> u32 {
            let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
            self.pos += 4;
            v
        }
        fn u64(&mut self) -> u64 {
            let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
            self.pos += 8;
            v
        }
        fn string(&mut self) -> String {
            let len = self.u64() as usize;
            let s = String::from_utf8(self.buf[self.pos..self.pos + len].to_vec()).unwrap();
            self.pos += len;
            s
        }
        fn skip_value(&mut self, type_id: u32) {
            match type_id {
                0 | 1 | 7 => self.pos += 1,
                2 | 3 => self.pos += 2,
                4 | 5 | 6 => self.pos += 4,
                10 | 11 | 12 => self.pos += 8,
                8 => {
                    self.string();
                }
                9 => {
                    let elem = self.u32();
                    let n = self.u64();
                    for _ in 0..n {
                        self.skip_value(elem);
                    }
                }
                _ => panic!("unknown type {type_id}"),
            }
        }
    }

    #[test]
    fn writes_parseable_v3_with_sorted_tensors() {
        let mut w = GgufWriter::new();
        w.add_kv("general.name", GgufValue::String("toy".into()));
        w.add_kv("general.file_type", GgufValue::U32(0));
        w.add_kv("toy.eps", GgufValue::F32(1e-5));
        w.add_kv("toy.flag", GgufValue::Bool(true));
        w.add_kv(
            "toy.names",
            GgufValue::Array(
                8,
                vec![GgufValue::String("a".into()), GgufValue::String("b".into())],
            ),
        );
        // added out of name order
        w.add_tensor(GgufTensor {
            name: "zz.weight".into(),
            dims: vec![2, 2],
            data: vec![9.0, 8.0, 7.0, 6.0],
        });
        w.add_tensor(GgufTensor {
            name: "aa.weight".into(),
            dims: vec![1, 3],
            data: vec![1.0, 2.0, 3.0],
        });

        let mut buf = Vec::new();
        w.write_to(&mut buf).unwrap();

        let mut c = Cursor { buf: &buf, pos: 0 };
        assert_eq!(&buf[0..4], b"GGUF");
        c.pos = 4;
        assert_eq!(c.u32(), GGUF_VERSION);
        let tensor_count = c.u64();
        let kv_count = c.u64();
        assert_eq!(tensor_count, 2);
        assert_eq!(kv_count, 5);

        for _ in 0..kv_count {
            let _key = c.string();
            let ty = c.u32();
            c.skip_value(ty);
        }

        let mut names = Vec::new();
        let mut descs = Vec::new();
        for _ in 0..tensor_count {
            let name = c.string();
            let n_dims = c.u32();
            let mut dims = Vec::new();
            for _ in 0..n_dims {
                dims.push(c.u64());
            }
            let ty = c.u32();
            let off = c.u64();
            assert_eq!(ty, GGML_TYPE_F32);
            names.push(name);
            descs.push((dims, off));
        }
        assert_eq!(names, vec!["aa.weight", "zz.weight"]);

        // data region starts aligned; offsets are region-relative
        let data_start = (c.pos as u64 + DATA_ALIGN - 1) / DATA_ALIGN * DATA_ALIGN;
        assert_eq!(descs[0].1, 0);
        assert_eq!(descs[1].1 % DATA_ALIGN, 0);
        let first = &buf[data_start as usize..data_start as usize + 12];
        let v: Vec<f32> = first
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(v, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rejects_dim_data_mismatch() {
        let mut w = GgufWriter::new();
        w.add_tensor(GgufTensor {
            name: "t".into(),
            dims: vec![2, 3],
            data: vec![0.0; 5],
        });
        let mut buf = Vec::new();
        assert_eq!(w.write_to(&mut buf).unwrap_err().category(), "shape");
    }

    #[test]
    fn rejects_mixed_array() {
        let mut w = GgufWriter::new();
        w.add_kv(
            "bad",
            GgufValue::Array(8, vec![GgufValue::U32(1)]),
        );
        let mut buf = Vec::new();
        assert!(w.write_to(&mut buf).is_err());
    }

    #[test]
    fn inspect_reads_header() {
        let mut w = GgufWriter::new();
        w.add_kv("k", GgufValue::U32(1));
        w.add_tensor(GgufTensor {
            name: "t".into(),
            dims: vec![1],
            data: vec![0.5],
        });
        let tmp = tempfile::NamedTempFile::new().unwrap();
        w.write(tmp.path()).unwrap();
        let info = inspect(tmp.path()).unwrap();
        assert_eq!(info.version, GGUF_VERSION);
        assert_eq!(info.tensor_count, 1);
        assert_eq!(info.kv_count, 1);
    }
}
