//! Utility functions for minikv-client

use crate::common::{Error, Result};
use std::time::Duration;

/// Largest hash key the server side accepts (length is stored as u16)
pub const MAX_HASH_KEY_LEN: usize = u16::MAX as usize;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(last)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => {
            return Err(Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Validate a hash key (must be non-empty and fit the server's length field)
pub fn validate_hash_key(hash_key: &[u8]) -> Result<()> {
    if hash_key.is_empty() {
        return Err(Error::InvalidArgument("hash key must not be empty".into()));
    }
    if hash_key.len() > MAX_HASH_KEY_LEN {
        return Err(Error::InvalidArgument(format!(
            "hash key too long ({} bytes, max {})",
            hash_key.len(),
            MAX_HASH_KEY_LEN
        )));
    }
    Ok(())
}

/// Validate a table name
pub fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(Error::InvalidArgument("table name must not be empty".into()));
    }
    if table.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(Error::InvalidArgument(format!(
            "table name contains invalid characters: {:?}",
            table
        )));
    }
    Ok(())
}
