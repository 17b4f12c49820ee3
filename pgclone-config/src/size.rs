use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A byte count that remembers the human-readable form it was written in.
///
/// `--split-tables-larger-than 10GB` keeps both the numeric value used for
/// partition planning and the pretty string echoed back in reports. A value
/// of zero means "disabled".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSize {
    pub bytes: u64,
    pub pretty: String,
}

/// Error parsing a human-readable byte size.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSizeError {
    #[error("empty size string")]
    Empty,
    #[error("invalid number in size string {0:?}")]
    InvalidNumber(String),
    #[error("unknown size unit {0:?}, expected one of B, kB, MB, GB, TB")]
    UnknownUnit(String),
}

impl ByteSize {
    pub fn from_bytes(bytes: u64) -> Self {
        ByteSize {
            bytes,
            pretty: pretty_print(bytes),
        }
    }

    /// True when no threshold is configured.
    pub fn is_disabled(&self) -> bool {
        self.bytes == 0
    }
}

impl FromStr for ByteSize {
    type Err = ParseSizeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseSizeError::Empty);
        }

        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(digits_end);

        let number: u64 = digits
            .parse()
            .map_err(|_| ParseSizeError::InvalidNumber(trimmed.to_string()))?;

        let multiplier = match unit.trim() {
            "" | "B" => 1,
            "kB" | "KB" | "k" | "K" => 1 << 10,
            "MB" | "M" => 1 << 20,
            "GB" | "G" => 1 << 30,
            "TB" | "T" => 1 << 40,
            other => return Err(ParseSizeError::UnknownUnit(other.to_string())),
        };

        Ok(ByteSize {
            bytes: number * multiplier,
            pretty: trimmed.to_string(),
        })
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty)
    }
}

fn pretty_print(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("kB", 1 << 10),
    ];

    for (unit, factor) in UNITS {
        if bytes >= factor && bytes % factor == 0 {
            return format!("{} {unit}", bytes / factor);
        }
    }
    for (unit, factor) in UNITS {
        if bytes >= factor {
            return format!("{:.1} {unit}", bytes as f64 / factor as f64);
        }
    }

    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!("1024".parse::<ByteSize>().unwrap().bytes, 1024);
    }

    #[test]
    fn parse_units() {
        assert_eq!("4kB".parse::<ByteSize>().unwrap().bytes, 4096);
        assert_eq!("10 MB".parse::<ByteSize>().unwrap().bytes, 10 << 20);
        assert_eq!("2GB".parse::<ByteSize>().unwrap().bytes, 2 << 30);
        assert_eq!("1TB".parse::<ByteSize>().unwrap().bytes, 1 << 40);
    }

    #[test]
    fn parse_keeps_pretty_form() {
        let size = "10GB".parse::<ByteSize>().unwrap();
        assert_eq!(size.pretty, "10GB");
        assert_eq!(size.to_string(), "10GB");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<ByteSize>(), Err(ParseSizeError::Empty));
        assert!(matches!(
            "12XB".parse::<ByteSize>(),
            Err(ParseSizeError::UnknownUnit(_))
        ));
        assert!(matches!(
            "GB".parse::<ByteSize>(),
            Err(ParseSizeError::InvalidNumber(_))
        ));
    }

    #[test]
    fn pretty_print_exact_multiples() {
        assert_eq!(ByteSize::from_bytes(0).pretty, "0 B");
        assert_eq!(ByteSize::from_bytes(3 << 30).pretty, "3 GB");
        assert_eq!(ByteSize::from_bytes(1536).pretty, "1.5 kB");
    }
}
