//! Gzip helpers for stored payloads
//!
//! Every record lands in the database as a gzip blob of its compact JSON form.
//! Readers of the table use [`gunzip`] to get the document back.

use crate::error::{CommonError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Gzip-compress `data` at the default level.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    gzip_with_level(data, Compression::default())
}

/// Gzip-compress `data` with an explicit level.
pub fn gzip_with_level(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), level);
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|e| CommonError::Compression(format!("Failed to finish gzip stream: {}", e)))
}

/// Decompress a gzip blob produced by [`gzip`].
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CommonError::Compression(format!("Failed to decompress gzip data: {}", e)))?;
    Ok(decompressed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_then_gunzip() {
        let doc = br#"{"activityDetails":{"instanceId":"42"}}"#;
        let blob = gzip(doc).unwrap();

        // gzip magic
        assert_eq!(&blob[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&blob).unwrap(), doc);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, CommonError::Compression(_)));
    }

    #[test]
    fn test_gzip_empty_input() {
        let blob = gzip(b"").unwrap();
        assert!(gunzip(&blob).unwrap().is_empty());
    }
}
