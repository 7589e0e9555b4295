//! Disk quantity parsing and formatting.
//!
//! Volume limits and guarantees arrive as strings:
//! - binary suffixes: "512Ki", "128Mi", "1Gi"
//! - decimal suffixes: "512k", "128M", "1G"
//! - plain numbers are bytes (or inode counts)
//!
//! Zero always means "unlimited" / "no guarantee".

use crate::error::{SiloError, SiloResult};

/// Parse a disk quantity string into bytes.
pub fn parse_size(s: &str) -> SiloResult<u64> {
    let s = s.trim();

    let binary_suffixes = [
        ("Ki", 1024u64),
        ("Mi", 1024 * 1024),
        ("Gi", 1024 * 1024 * 1024),
        ("Ti", 1024 * 1024 * 1024 * 1024),
    ];

    for (suffix, multiplier) in binary_suffixes {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.parse().map_err(|_| SiloError::InvalidValue {
                message: format!("bad size '{}'", s),
            })?;
            return Ok(value * multiplier);
        }
    }

    let decimal_suffixes = [
        ("k", 1000u64),
        ("K", 1000),
        ("M", 1000 * 1000),
        ("G", 1000 * 1000 * 1000),
        ("T", 1000 * 1000 * 1000 * 1000),
    ];

    for (suffix, multiplier) in decimal_suffixes {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.parse().map_err(|_| SiloError::InvalidValue {
                message: format!("bad size '{}'", s),
            })?;
            return Ok(value * multiplier);
        }
    }

    s.parse().map_err(|_| SiloError::InvalidValue {
        message: format!("bad size '{}'", s),
    })
}

/// Format a byte count with the largest exact binary suffix.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const GI: u64 = 1024 * 1024 * 1024;
    const MI: u64 = 1024 * 1024;
    const KI: u64 = 1024;

    if bytes >= GI && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes >= MI && bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else if bytes >= KI && bytes % KI == 0 {
        format!("{}Ki", bytes / KI)
    } else {
        bytes.to_string()
    }
}

/// Parse an octal permission string ("0775" or "775").
pub fn parse_octal(s: &str) -> SiloResult<u32> {
    let trimmed = s.trim().trim_start_matches("0o");
    u32::from_str_radix(trimmed, 8).map_err(|_| SiloError::InvalidValue {
        message: format!("bad octal value '{}'", s),
    })
}

/// Format a permission value the way it is persisted ("0775").
#[must_use]
pub fn format_octal(mode: u32) -> String {
    format!("0{:o}", mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binary() {
        assert_eq!(parse_size("1Ki").unwrap(), 1024);
        assert_eq!(parse_size("128Mi").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("1Gi").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_decimal() {
        assert_eq!(parse_size("1k").unwrap(), 1000);
        assert_eq!(parse_size("128M").unwrap(), 128 * 1000 * 1000);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1000 * 1000 * 1000);
    }

    #[test]
    fn parse_plain_and_zero() {
        assert_eq!(parse_size("1048576").unwrap(), 1048576);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn parse_garbage() {
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12Qi").is_err());
        assert!(parse_size("-5").is_err());
    }

    #[test]
    fn size_roundtrip() {
        assert_eq!(format_size(64 * 1024 * 1024), "64Mi");
        assert_eq!(format_size(1024), "1Ki");
        assert_eq!(format_size(1000), "1000");
        assert_eq!(parse_size(&format_size(3 * 1024 * 1024)).unwrap(), 3 * 1024 * 1024);
    }

    #[test]
    fn octal() {
        assert_eq!(parse_octal("0775").unwrap(), 0o775);
        assert_eq!(parse_octal("700").unwrap(), 0o700);
        assert_eq!(format_octal(0o775), "0775");
        assert_eq!(parse_octal(&format_octal(0o1777)).unwrap(), 0o1777);
        assert!(parse_octal("rwx").is_err());
    }
}
