//! Value compression for the item compressor.
//!
//! Uses zstd with magic-bytes detection so that decompression can accept
//! both compressed and raw values.

use std::io;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression level (3 is a good balance of speed/ratio)
const COMPRESSION_LEVEL: i32 = 3;

/// Compress a value. Returns None when compression does not shrink it,
/// in which case the caller keeps the raw bytes.
pub fn compress(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < ZSTD_MAGIC.len() {
        return None;
    }
    let compressed = zstd::stream::encode_all(raw, COMPRESSION_LEVEL).ok()?;
    if compressed.len() < raw.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a value. Raw (non-zstd) input is returned unchanged.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    zstd::stream::decode_all(data)
}

#[inline]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= ZSTD_MAGIC.len() && data[..ZSTD_MAGIC.len()] == ZSTD_MAGIC
}
