//! Request path decoding.
//!
//! A raw URL path is split on `/` first and each segment is percent-decoded
//! afterwards, so an encoded slash (`%2F`) stays inside a single key.
//! Empty segments are dropped: `/a//b/` addresses the same node as `/a/b`
//! and `/` addresses the document root.

use percent_encoding::percent_decode_str;

use crate::error::{Result, StoreError};

/// Decode a raw request path into ordered segments.
pub fn parse_path(raw: &str) -> Result<Vec<String>> {
    raw.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|_| {
                    StoreError::BadRequest(format!("path segment is not valid UTF-8: {}", segment))
                })
        })
        .collect()
}

/// Render segments back into a slash-delimited path.
pub fn display_path(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}
