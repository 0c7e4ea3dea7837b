//! Lenient hex text parsing for keys typed by users or printed by programs.

use crate::error::{Error, Result};

/// Parse a hex string, ignoring whitespace and an optional `0x` prefix.
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(digits)
        .map_err(|e| Error::InvalidArgument(format!("invalid hex string {trimmed:?}: {e}")))
}
