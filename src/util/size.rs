//! Byte-size constants, helpers and human-readable parsing.

use crate::error::ConfigError;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;
pub const GB: usize = 1024 * 1024 * 1024;

/// `n` kilobytes.
pub const fn kb(n: usize) -> usize {
    n * KB
}

/// `n` megabytes.
pub const fn mb(n: usize) -> usize {
    n * MB
}

/// `n` gigabytes.
pub const fn gb(n: usize) -> usize {
    n * GB
}

/// Parse a human-readable size string such as `"256M"`, `"4g"`, `"8192"`.
///
/// A bare number is bytes. Suffixes `k`, `m`, `g` (case-insensitive, with
/// optional trailing `b`) scale by powers of 1024.
pub fn parse(s: &str) -> Result<usize, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidMemorySize("empty size string".to_string()));
    }

    let lower = s.to_ascii_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);

    let (digits, multiplier) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], KB),
        Some(b'm') => (&lower[..lower.len() - 1], MB),
        Some(b'g') => (&lower[..lower.len() - 1], GB),
        _ => (&lower[..], 1),
    };

    let value: usize = digits
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidMemorySize(format!("cannot parse size: {s:?}")))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidMemorySize(format!("size overflows: {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse("8192").unwrap(), 8192);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse("256M").unwrap(), mb(256));
        assert_eq!(parse("4g").unwrap(), gb(4));
        assert_eq!(parse("16K").unwrap(), kb(16));
        assert_eq!(parse("1mb").unwrap(), MB);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("lots").is_err());
        assert!(parse("12q").is_err());
    }
}
