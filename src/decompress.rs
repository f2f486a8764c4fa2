//! Content-Encoding aware decoding of captured bodies
//!
//! Supports gzip, deflate (zlib-wrapped or raw) and brotli. Unknown encodings
//! pass through untouched; malformed streams fall back to the raw bytes so a
//! bad body never fails the exchange it belongs to.

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DecompressionError {
    #[error("malformed {encoding} body: {source}")]
    Malformed {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A single content coding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl ContentEncoding {
    /// Parse one coding token; `None` for codings we cannot decode
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            "identity" | "" => Some(Self::Identity),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
            Self::Identity => "identity",
        }
    }
}

/// Decode `raw` according to a `Content-Encoding` header value
///
/// Codings are undone in reverse order of application. Output is capped at
/// `limit` bytes. Never fails: unknown codings and decode errors return the
/// raw bytes.
pub fn decode_body(raw: &Bytes, content_encoding: Option<&str>, limit: usize) -> Bytes {
    let Some(header) = content_encoding else {
        return raw.clone();
    };

    let mut codings = Vec::new();
    for token in header.split(',') {
        match ContentEncoding::from_token(token) {
            Some(ContentEncoding::Identity) => {}
            Some(coding) => codings.push(coding),
            None => {
                debug!(content_encoding = %header, "Unsupported content encoding, keeping raw body");
                return raw.clone();
            }
        }
    }

    let mut body = raw.clone();
    for coding in codings.into_iter().rev() {
        match decode(&body, coding, limit) {
            Ok(decoded) => body = decoded,
            Err(e) => {
                warn!(error = %e, "Body decompression failed, keeping raw bytes");
                return raw.clone();
            }
        }
    }
    body
}

/// Undo a single coding
pub fn decode(data: &[u8], coding: ContentEncoding, limit: usize) -> Result<Bytes, DecompressionError> {
    let limit = limit as u64;
    let mut out = Vec::new();

    let result = match coding {
        ContentEncoding::Identity => return Ok(Bytes::copy_from_slice(data)),
        ContentEncoding::Gzip => MultiGzDecoder::new(data).take(limit).read_to_end(&mut out),
        ContentEncoding::Brotli => brotli::Decompressor::new(data, 4096)
            .take(limit)
            .read_to_end(&mut out),
        ContentEncoding::Deflate => {
            // Servers disagree on whether "deflate" carries the zlib wrapper
            match ZlibDecoder::new(data).take(limit).read_to_end(&mut out) {
                Ok(n) => Ok(n),
                Err(_) => {
                    out.clear();
                    DeflateDecoder::new(data).take(limit).read_to_end(&mut out)
                }
            }
        }
    };

    result.map_err(|source| DecompressionError::Malformed {
        encoding: coding.name(),
        source,
    })?;
    Ok(Bytes::from(out))
}
