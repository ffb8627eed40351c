//! Byte-size string parsing for volume size configuration.

use crate::error::{Result, StorageError};

/// Parse a human readable byte size string (e.g. `"10GiB"`, `"500MB"`, `"1048576"`).
///
/// Decimal suffixes (`kB`, `MB`, ...) are powers of 1000, binary suffixes
/// (`KiB`, `MiB`, ...) powers of 1024. A bare number is a byte count.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StorageError::InvalidSize {
            value: value.to_string(),
            reason: "empty size string".to_string(),
        });
    }

    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let count: u64 = digits.parse().map_err(|_| StorageError::InvalidSize {
        value: value.to_string(),
        reason: "missing numeric prefix".to_string(),
    })?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "mb" => 1000u64.pow(2),
        "gb" => 1000u64.pow(3),
        "tb" => 1000u64.pow(4),
        "pb" => 1000u64.pow(5),
        "eb" => 1000u64.pow(6),
        "kib" => 1024,
        "mib" => 1024u64.pow(2),
        "gib" => 1024u64.pow(3),
        "tib" => 1024u64.pow(4),
        "pib" => 1024u64.pow(5),
        "eib" => 1024u64.pow(6),
        other => {
            return Err(StorageError::InvalidSize {
                value: value.to_string(),
                reason: format!("unknown suffix {:?}", other),
            })
        }
    };

    count.checked_mul(multiplier).ok_or_else(|| StorageError::InvalidSize {
        value: value.to_string(),
        reason: "size overflows u64".to_string(),
    })
}
