//! Utility functions for minigd

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for store path segments (includes /, %, and control chars)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a resource name so it is a single store path segment
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
