//! Content codec: transparent gzip for large note bodies.
//!
//! Policy: compress when the content exceeds the threshold and the note's
//! representation policy is not `verbatim`. Compressed payloads are stored
//! as `gz:` + base64 so the storage layer stays type-agnostic; anything
//! else passes through untouched.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use teambook_core::{RepresentationPolicy, COMPRESS_THRESHOLD_BYTES};

const MARKER: &str = "gz:";

/// Stateless content codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentCodec;

impl ContentCodec {
    /// Encode per policy. Falls back to the raw text when compression does
    /// not shrink the payload.
    pub fn encode(&self, text: &str, policy: RepresentationPolicy) -> String {
        if policy == RepresentationPolicy::Verbatim || text.len() < COMPRESS_THRESHOLD_BYTES {
            return text.to_string();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(text.as_bytes()).is_err() {
            return text.to_string();
        }
        match encoder.finish() {
            Ok(compressed) => {
                let encoded = format!("{}{}", MARKER, B64.encode(compressed));
                if encoded.len() < text.len() {
                    encoded
                } else {
                    text.to_string()
                }
            }
            Err(_) => text.to_string(),
        }
    }

    /// Decode a stored payload. Plain text passes through; a corrupt
    /// compressed payload is returned as-is rather than lost.
    pub fn decode(&self, stored: &str) -> String {
        let Some(b64) = stored.strip_prefix(MARKER) else {
            return stored.to_string();
        };
        let Ok(compressed) = B64.decode(b64) else {
            return stored.to_string();
        };
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut out = String::new();
        if decoder.read_to_string(&mut out).is_ok() {
            out
        } else {
            stored.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_content_passes_through() {
        let codec = ContentCodec;
        let text = "short note";
        assert_eq!(codec.encode(text, RepresentationPolicy::Default), text);
    }

    #[test]
    fn test_large_content_roundtrip() {
        let codec = ContentCodec;
        let text = "the quick brown fox jumps over the lazy dog ".repeat(40);
        let encoded = codec.encode(&text, RepresentationPolicy::Default);
        assert!(encoded.starts_with(MARKER));
        assert!(encoded.len() < text.len());
        assert_eq!(codec.decode(&encoded), text);
    }

    #[test]
    fn test_verbatim_never_compressed() {
        let codec = ContentCodec;
        let text = "x".repeat(4000);
        assert_eq!(codec.encode(&text, RepresentationPolicy::Verbatim), text);
    }

    #[test]
    fn test_decode_plain_text() {
        let codec = ContentCodec;
        assert_eq!(codec.decode("plain"), "plain");
    }
}
