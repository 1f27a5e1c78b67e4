//! Typed supervisor parameters and kernel-style scaled integers.
//!
//! Parameter values follow the kernel command-line convention: integers may
//! carry a single `K`/`M`/`G` suffix (case-insensitive) multiplying by 2^10,
//! 2^20 or 2^30, and are written in decimal, octal (leading `0`) or
//! hexadecimal (leading `0x`).

use crate::syslog::LogLevel;

/// Failure modes of [`parse_scaled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaledIntError {
    /// The string is not a number or carries an unrecognized suffix.
    Invalid,
    /// The multiplied value does not fit in the target type.
    Overflow,
}

/// Parses a scaled unsigned integer.
pub fn parse_scaled(value: &str) -> Result<u64, ScaledIntError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ScaledIntError::Invalid);
    }

    let (digits, multiplier) = match value.char_indices().next_back() {
        Some((last, 'k' | 'K')) => (&value[..last], 1u64 << 10),
        Some((last, 'm' | 'M')) => (&value[..last], 1u64 << 20),
        Some((last, 'g' | 'G')) => (&value[..last], 1u64 << 30),
        _ => (value, 1),
    };

    // Base detection as strtoul(..., 0) would do it.
    let (digits, radix) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (&digits[1..], 8)
    } else {
        (digits, 10)
    };

    let parsed = u64::from_str_radix(digits, radix).map_err(|_| ScaledIntError::Invalid)?;
    parsed.checked_mul(multiplier).ok_or(ScaledIntError::Overflow)
}

/// Parses an unscaled unsigned integer with `strtoul`-style base detection:
/// `0x` for hexadecimal, a leading `0` for octal, decimal otherwise.
pub fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, radix) = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        (hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        (&value[1..], 8)
    } else {
        (value, 10)
    };
    u64::from_str_radix(digits, radix).ok()
}

/// Outcome of a single parameter assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOutcome {
    /// The key was recognized and the value parsed.
    Parsed,
    /// The key was recognized but the value failed to parse.
    Invalid,
    /// The key does not name a parameter.
    Unknown,
}

/// The supervisor's typed parameter table.
#[derive(Debug, Clone)]
pub struct Params {
    /// Size of the system log ring buffer, in bytes.
    pub log_buf_len: u64,
    /// Default logging level.
    pub loglevel: LogLevel,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            log_buf_len: 2 << 20,
            loglevel: LogLevel::Warning,
        }
    }
}

impl Params {
    /// Applies one `key=value` assignment. The key must already be
    /// normalized (lower case, hyphens replaced by underscores).
    pub fn try_set(&mut self, key: &str, value: &str) -> ParamOutcome {
        match key {
            "log_buf_len" => match parse_scaled(value) {
                Ok(len) => {
                    self.log_buf_len = len;
                    ParamOutcome::Parsed
                }
                Err(_) => ParamOutcome::Invalid,
            },
            "loglevel" => match value.trim().parse::<i8>().ok().and_then(|v| LogLevel::try_from(v).ok()) {
                Some(level) if level != LogLevel::Default => {
                    self.loglevel = level;
                    ParamOutcome::Parsed
                }
                _ => ParamOutcome::Invalid,
            },
            _ => ParamOutcome::Unknown,
        }
    }
}
