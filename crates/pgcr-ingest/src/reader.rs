//! Streaming decompression and line scanning
//!
//! Input files are opened through a buffered async decompressor and split on
//! `\n` with a hard upper bound on line length, so a single oversized record
//! is reported instead of buffered without limit.

use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

use crate::error::{IngestError, Result};

/// Largest line accepted by default (46 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 46 * 1024 * 1024;

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Compression of the input files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputCompression {
    #[default]
    Zstd,
    Gzip,
    None,
}

impl InputCompression {
    /// Wrap a buffered reader with the matching decompressor.
    ///
    /// Concatenated frames (or gzip members) are read as one stream. Corrupt
    /// headers surface on the first read, not here.
    pub fn wrap_reader<R>(&self, reader: R) -> Box<dyn AsyncRead + Send + Unpin>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        match self {
            InputCompression::Zstd => {
                let mut decoder = ZstdDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(decoder)
            }
            InputCompression::Gzip => {
                let mut decoder = GzipDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(decoder)
            }
            InputCompression::None => Box::new(reader),
        }
    }
}

impl std::str::FromStr for InputCompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zstd" | "zst" => Ok(InputCompression::Zstd),
            "gzip" | "gz" => Ok(InputCompression::Gzip),
            "none" | "plain" => Ok(InputCompression::None),
            _ => Err(format!("Invalid compression: {}", s)),
        }
    }
}

/// Line-by-line reader over one input file.
pub struct LineReader {
    path: PathBuf,
    max_line_bytes: usize,
    frames: FramedRead<Box<dyn AsyncRead + Send + Unpin>, AnyDelimiterCodec>,
    next_line: u64,
}

impl LineReader {
    /// Open `path` and prepare to scan it.
    pub async fn open(
        path: &Path,
        compression: InputCompression,
        max_line_bytes: usize,
    ) -> Result<Self> {
        let file = File::open(path).await.map_err(|source| IngestError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let reader = compression.wrap_reader(BufReader::with_capacity(READ_BUFFER_BYTES, file));
        let codec = AnyDelimiterCodec::new_with_max_length(vec![b'\n'], vec![b'\n'], max_line_bytes);

        Ok(Self {
            path: path.to_path_buf(),
            max_line_bytes,
            frames: FramedRead::new(reader, codec),
            next_line: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines returned so far.
    pub fn lines_read(&self) -> u64 {
        self.next_line
    }

    /// Next line with its zero-based number, or `None` at end of file.
    ///
    /// A trailing `\r` is stripped. Empty lines are returned like any other.
    pub async fn next_line(&mut self) -> Result<Option<(u64, Bytes)>> {
        let line = self.next_line;

        match self.frames.next().await {
            None => Ok(None),
            Some(Ok(mut bytes)) => {
                if bytes.last() == Some(&b'\r') {
                    bytes.truncate(bytes.len() - 1);
                }
                self.next_line += 1;
                Ok(Some((line, bytes)))
            }
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                Err(IngestError::LineTooLong {
                    path: self.path.clone(),
                    line,
                    max_bytes: self.max_line_bytes,
                })
            }
            Some(Err(AnyDelimiterCodecError::Io(source))) => Err(IngestError::Read {
                path: self.path.clone(),
                line,
                source,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zstd(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let compressed = zstd::encode_all(content, 3).unwrap();
        std::fs::write(&path, compressed).unwrap();
        path
    }

    async fn collect(reader: &mut LineReader) -> Vec<(u64, String)> {
        let mut lines = Vec::new();
        while let Some((n, bytes)) = reader.next_line().await.unwrap() {
            lines.push((n, String::from_utf8(bytes.to_vec()).unwrap()));
        }
        lines
    }

    #[tokio::test]
    async fn test_reads_zstd_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let path = write_zstd(&dir, "a.jsonl.zst", b"one\ntwo\r\nthree");

        let mut reader = LineReader::open(&path, InputCompression::Zstd, 1024).await.unwrap();
        let lines = collect(&mut reader).await;

        assert_eq!(
            lines,
            vec![
                (0, "one".to_string()),
                (1, "two".to_string()),
                (2, "three".to_string())
            ]
        );
        assert_eq!(reader.lines_read(), 3);
    }

    #[tokio::test]
    async fn test_empty_lines_are_kept() {
        let dir = TempDir::new().unwrap();
        let path = write_zstd(&dir, "a.zst", b"a\n\nb\n");

        let mut reader = LineReader::open(&path, InputCompression::Zstd, 1024).await.unwrap();
        let lines: Vec<_> = collect(&mut reader).await.into_iter().map(|(_, l)| l).collect();
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn test_concatenated_zstd_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("multi.zst");
        let mut data = zstd::encode_all(&b"first\n"[..], 3).unwrap();
        data.extend(zstd::encode_all(&b"second\n"[..], 3).unwrap());
        std::fs::write(&path, data).unwrap();

        let mut reader = LineReader::open(&path, InputCompression::Zstd, 1024).await.unwrap();
        assert_eq!(collect(&mut reader).await.len(), 2);
    }

    #[tokio::test]
    async fn test_gzip_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.gz");
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"x\ny\n").unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let mut reader = LineReader::open(&path, InputCompression::Gzip, 1024).await.unwrap();
        assert_eq!(collect(&mut reader).await.len(), 2);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let dir = TempDir::new().unwrap();
        let mut content = b"short\n".to_vec();
        content.extend(std::iter::repeat(b'x').take(64));
        content.push(b'\n');
        let path = write_zstd(&dir, "long.zst", &content);

        let mut reader = LineReader::open(&path, InputCompression::Zstd, 16).await.unwrap();
        assert!(reader.next_line().await.unwrap().is_some());

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::LineTooLong {
                line: 1,
                max_bytes: 16,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_stream_is_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.zst");
        std::fs::write(&path, b"definitely not zstd").unwrap();

        let mut reader = LineReader::open(&path, InputCompression::Zstd, 1024).await.unwrap();
        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err, IngestError::Read { line: 0, .. }));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = LineReader::open(Path::new("/nonexistent/a.zst"), InputCompression::Zstd, 1024).await;
        assert!(matches!(result, Err(IngestError::Open { .. })));
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("ZSTD".parse::<InputCompression>().unwrap(), InputCompression::Zstd);
        assert_eq!("gz".parse::<InputCompression>().unwrap(), InputCompression::Gzip);
        assert_eq!("none".parse::<InputCompression>().unwrap(), InputCompression::None);
        assert!("lz4".parse::<InputCompression>().is_err());
    }
}
