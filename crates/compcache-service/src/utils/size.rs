//! Parsing and formatting of sizes and ages as they appear in configuration and reports.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid size: \"{0}\"")]
pub struct InvalidSize(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDuration {
    #[error("invalid suffix (supported: d (day) and s (second)): \"{0}\"")]
    Suffix(String),
    #[error("invalid unsigned integer: \"{0}\"")]
    Number(String),
}

/// Parses a size like `"5G"`, `"1.5 Mi"` or `"42"` into a number of bytes.
///
/// Supported suffixes are `k`/`K`, `M`, `G` and `T` (powers of 1000) and the same letters followed
/// by `i` (powers of 1024). A number without suffix is in gigabytes. Fractional results are
/// truncated.
pub fn parse_size(value: &str) -> Result<u64, InvalidSize> {
    let invalid = || InvalidSize(value.to_owned());

    let number_len = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(number_len);
    if number.is_empty() {
        return Err(invalid());
    }
    let mut result: f64 = number.parse().map_err(|_| invalid())?;

    let suffix = suffix.trim_start();
    let mut chars = suffix.chars();
    let Some(unit) = chars.next() else {
        return Ok((result * 1000.0 * 1000.0 * 1000.0) as u64);
    };
    let multiplier = match chars.as_str() {
        "" => 1000.0,
        "i" => 1024.0,
        _ => return Err(invalid()),
    };
    let exponent = match unit {
        'k' | 'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        _ => return Err(invalid()),
    };
    for _ in 0..exponent {
        result *= multiplier;
    }
    Ok(result as u64)
}

/// Formats a size for humans, e.g. `"1.2 MB"`.
pub fn format_human_readable_size(size: u64) -> String {
    if size >= 1000 * 1000 * 1000 {
        format!("{:.1} GB", size as f64 / (1000.0 * 1000.0 * 1000.0))
    } else if size >= 1000 * 1000 {
        format!("{:.1} MB", size as f64 / (1000.0 * 1000.0))
    } else {
        format!("{:.1} kB", size as f64 / 1000.0)
    }
}

/// Formats a size so that [`parse_size`] reads it back, e.g. `"1.2M"`.
pub fn format_parsable_size_with_suffix(size: u64) -> String {
    if size >= 1000 * 1000 * 1000 {
        format!("{:.1}G", size as f64 / (1000.0 * 1000.0 * 1000.0))
    } else if size >= 1000 * 1000 {
        format!("{:.1}M", size as f64 / (1000.0 * 1000.0))
    } else {
        size.to_string()
    }
}

/// Parses an age like `"2s"` or `"1d"`.
pub fn parse_duration(value: &str) -> Result<Duration, InvalidDuration> {
    let (number, factor) = if let Some(number) = value.strip_suffix('d') {
        (number, 24 * 60 * 60)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1)
    } else {
        return Err(InvalidDuration::Suffix(value.to_owned()));
    };

    let number: u64 = number
        .parse()
        .map_err(|_| InvalidDuration::Number(number.to_owned()))?;
    Ok(Duration::from_secs(number * factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("42"), Ok(42 * 1000 * 1000 * 1000));

        assert_eq!(parse_size("78k"), Ok(78 * 1000));
        assert_eq!(parse_size("78K"), Ok(78 * 1000));
        assert_eq!(parse_size("1.1 M"), Ok((1.1 * 1000.0 * 1000.0) as u64));
        assert_eq!(parse_size("438.55M"), Ok((438.55 * 1000.0 * 1000.0) as u64));
        assert_eq!(parse_size("1 G"), Ok(1000 * 1000 * 1000));
        assert_eq!(parse_size("2T"), Ok(2 * 1000 * 1000 * 1000 * 1000));

        assert_eq!(parse_size("78 Ki"), Ok(78 * 1024));
        assert_eq!(parse_size("1.1Mi"), Ok((1.1 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_size("438.55 Mi"), Ok((438.55 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_size("1Gi"), Ok(1024 * 1024 * 1024));
        assert_eq!(parse_size("2 Ti"), Ok(2 * 1024 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size_errors() {
        assert_eq!(parse_size("").unwrap_err().to_string(), r#"invalid size: """#);
        assert_eq!(parse_size("x").unwrap_err().to_string(), r#"invalid size: "x""#);
        assert_eq!(
            parse_size("10x").unwrap_err().to_string(),
            r#"invalid size: "10x""#
        );
        assert!(parse_size("-2").is_err());
        assert!(parse_size("1Gx").is_err());
    }

    #[test]
    fn test_format_human_readable_size() {
        assert_eq!(format_human_readable_size(0), "0.0 kB");
        assert_eq!(format_human_readable_size(1), "0.0 kB");
        assert_eq!(format_human_readable_size(49), "0.0 kB");
        assert_eq!(format_human_readable_size(51), "0.1 kB");
        assert_eq!(format_human_readable_size(949), "0.9 kB");
        assert_eq!(format_human_readable_size(951), "1.0 kB");
        assert_eq!(format_human_readable_size(499_700), "499.7 kB");
        assert_eq!(format_human_readable_size(1_000_000), "1.0 MB");
        assert_eq!(format_human_readable_size(1_234_000), "1.2 MB");
        assert_eq!(format_human_readable_size(438_500_000), "438.5 MB");
        assert_eq!(format_human_readable_size(1_000_000_000), "1.0 GB");
        assert_eq!(format_human_readable_size(17_110_000_000), "17.1 GB");
    }

    #[test]
    fn test_format_parsable_size_with_suffix() {
        assert_eq!(format_parsable_size_with_suffix(0), "0");
        assert_eq!(format_parsable_size_with_suffix(42_000), "42000");
        assert_eq!(format_parsable_size_with_suffix(1_000_000), "1.0M");
        assert_eq!(format_parsable_size_with_suffix(1_234_000), "1.2M");
        assert_eq!(format_parsable_size_with_suffix(438_500_000), "438.5M");
        assert_eq!(format_parsable_size_with_suffix(1_000_000_000), "1.0G");
        assert_eq!(format_parsable_size_with_suffix(17_110_000_000), "17.1G");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86400)));

        for invalid in ["-2", "2x", "2"] {
            assert_eq!(
                parse_duration(invalid).unwrap_err().to_string(),
                format!(r#"invalid suffix (supported: d (day) and s (second)): "{invalid}""#)
            );
        }
        assert_eq!(
            parse_duration("xd"),
            Err(InvalidDuration::Number("x".to_owned()))
        );
    }
}
