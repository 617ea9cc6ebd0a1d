//! Zstd and LZ4-frame payload codecs shared by sections and shards.

use std::io::Read;

use vassago_core::{Error, Result};

/// Compress with Zstandard at the default level.
pub fn zstd_encode(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(data, 0)
        .map_err(|e| Error::format(format!("zstd encode: {e}")))
}

/// Decompress a Zstandard frame.
pub fn zstd_decode(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data)
        .map_err(|e| Error::format(format!("zstd decode: {e}")))
}

/// Compress into an LZ4 frame.
pub fn lz4_encode(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;
    let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
    enc.write_all(data)
        .map_err(|e| Error::format(format!("lz4 encode: {e}")))?;
    enc.finish()
        .map_err(|e| Error::format(format!("lz4 encode: {e}")))
}

/// Decompress an LZ4 frame.
pub fn lz4_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut dec = lz4_flex::frame::FrameDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)
        .map_err(|e| Error::format(format!("lz4 decode: {e}")))?;
    Ok(out)
}
