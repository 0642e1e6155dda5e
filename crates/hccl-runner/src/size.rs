use crate::error::{LaunchError, Result};
use crate::report::Reporter;

const STAGE: &str = "parse_size";

fn unit_multiplier(unit: char) -> Option<u64> {
    match unit.to_ascii_uppercase() {
        'G' => Some(1 << 30),
        'M' => Some(1 << 20),
        'K' => Some(1 << 10),
        'B' => Some(1),
        _ => None,
    }
}

/// Converts a size token such as `4G`, `1.5m` or `33554432` to a byte count.
///
/// A token that does not end in a letter is already a byte count and is
/// returned untouched. An unknown unit letter is reported as a warning and
/// treated as bytes.
pub fn parse_size(token: &str, reporter: &dyn Reporter) -> Result<String> {
    let token = token.trim();
    let unit = token
        .chars()
        .last()
        .ok_or_else(|| LaunchError::config(STAGE, "size must not be empty"))?;

    if !unit.is_alphabetic() {
        reporter.debug(STAGE, "unit was not specified, using bytes");
        return Ok(token.to_string());
    }

    let digits = &token[..token.len() - unit.len_utf8()];
    let number: f64 = digits.parse().map_err(|_| {
        LaunchError::config(STAGE, format!("cannot parse size '{}' as a number", token))
    })?;
    if !number.is_finite() || number < 0.0 {
        return Err(LaunchError::config(
            STAGE,
            format!("size '{}' must be a non-negative number", token),
        ));
    }

    let multiplier = match unit_multiplier(unit) {
        Some(m) => m,
        None => {
            reporter.warn(
                STAGE,
                &format!(
                    "unit '{}' is not supported, choose between G,M,K,B or no unit; using bytes",
                    unit
                ),
            );
            1
        }
    };
    let scaled = (number * multiplier as f64).floor();
    // u64::MAX as f64 rounds up to 2^64, so anything at or above it would saturate.
    if scaled >= u64::MAX as f64 {
        return Err(LaunchError::config(
            STAGE,
            format!("size '{}' does not fit in a 64-bit byte count", token),
        ));
    }
    let bytes = scaled as u64;
    reporter.debug(STAGE, &format!("requested size {} -> {} bytes", token, bytes));
    Ok(bytes.to_string())
}
