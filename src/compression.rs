//! Gzip encoding for strategies that compress their values

use crate::error::{CacheError, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress a value for storage
pub fn compress(value: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(value.len() / 2 + 16), Compression::fast());
    encoder
        .write_all(value)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    let encoded = encoder
        .finish()
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(Bytes::from(encoded))
}

/// Decompress a stored value. Fails on data that is not gzip.
pub fn decompress(stored: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(stored);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(Bytes::from(decoded))
}

/// Encode for storage according to a policy flag
pub fn encode(value: Bytes, compress_value: bool) -> Result<Bytes> {
    if compress_value {
        compress(&value)
    } else {
        Ok(value)
    }
}

/// Decode stored bytes according to a policy flag
pub fn decode(stored: Bytes, compressed: bool) -> Result<Bytes> {
    if compressed {
        decompress(&stored)
    } else {
        Ok(stored)
    }
}
