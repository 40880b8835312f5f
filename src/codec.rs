//! Chunk encoding for the JSON message channel
//!
//! File bytes travel as base64 text inside JSON events. This module owns the
//! encoding, the chunk arithmetic shared by uploads and downloads, and the
//! incremental UTF-8 decoder used for shell output.

use std::ops::Range;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Chunk size used by the download pump (5 MiB)
pub const DOWNLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Chunk size used by the bundled client when uploading (64 KiB)
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

pub fn encode_chunk(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_chunk(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(content)
}

/// Number of chunks needed to carry `size` bytes. Zero bytes need zero chunks.
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Byte range covered by chunk `index` of a `size`-byte file.
pub fn chunk_range(index: u64, size: u64, chunk_size: usize) -> Range<u64> {
    let start = index.saturating_mul(chunk_size as u64).min(size);
    let end = start.saturating_add(chunk_size as u64).min(size);
    start..end
}

/// Decodes a byte stream into text without splitting multi-byte characters.
///
/// An incomplete UTF-8 sequence at the end of one read is held back and
/// completed by the next. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flushes any held-back bytes as replacement characters.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, DOWNLOAD_CHUNK_SIZE), 0);
        assert_eq!(total_chunks(1, DOWNLOAD_CHUNK_SIZE), 1);
        assert_eq!(total_chunks(DOWNLOAD_CHUNK_SIZE as u64, DOWNLOAD_CHUNK_SIZE), 1);
        assert_eq!(total_chunks(12 * 1024 * 1024, DOWNLOAD_CHUNK_SIZE), 3);
        assert_eq!(total_chunks(12 * 1024 * 1024, UPLOAD_CHUNK_SIZE), 192);
    }

    #[test]
    fn test_chunk_ranges_cover_file() {
        let size = 12 * 1024 * 1024;
        let ranges: Vec<_> = (0..3).map(|i| chunk_range(i, size, DOWNLOAD_CHUNK_SIZE)).collect();
        let mib = 1024 * 1024;
        assert_eq!(ranges[0], 0..5 * mib);
        assert_eq!(ranges[1], 5 * mib..10 * mib);
        assert_eq!(ranges[2], 10 * mib..12 * mib);
        assert_eq!(chunk_range(3, size, DOWNLOAD_CHUNK_SIZE), size..size);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_chunk("not base64!").is_err());
        assert_eq!(decode_chunk("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_chunk(&encode_chunk(b"hello")).unwrap(), b"hello");
    }

    #[test]
    fn test_utf8_stream_split_sequence() {
        let text = "héllo → wörld";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Stream::new();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn test_utf8_stream_invalid_bytes() {
        let mut decoder = Utf8Stream::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xe2\x86"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
