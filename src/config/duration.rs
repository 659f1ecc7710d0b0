//! # Durations
//!
//! Parses duration strings used by the watch configuration, environment
//! variables and the `requeue_after` task result.

use anyhow::{Result, anyhow};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+)(?P<unit>ms|[smhd])")
        .unwrap_or_else(|e| panic!("Failed to compile duration regex: {e}"))
});

/// Parse a Kubernetes duration string into a `Duration`.
///
/// Accepts `<number><unit>` with unit `ms`, `s`, `m`, `h` or `d`, and
/// sequences of them such as `1h30m`. Zero durations are rejected.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Duration string cannot be empty"));
    }
    let lower = trimmed.to_lowercase();

    let mut total = Duration::ZERO;
    let mut covered = 0;
    for captures in DURATION_PART.captures_iter(&lower) {
        let (Some(whole), Some(number), Some(unit)) =
            (captures.get(0), captures.name("number"), captures.name("unit"))
        else {
            continue;
        };
        if whole.start() != covered {
            break;
        }
        covered = whole.end();

        let number: u64 = number.as_str().parse().map_err(|e| {
            anyhow!("Invalid duration number '{}' in '{trimmed}': {e}", number.as_str())
        })?;
        total += match unit.as_str() {
            "ms" => Duration::from_millis(number),
            "s" => Duration::from_secs(number),
            "m" => Duration::from_secs(number * 60),
            "h" => Duration::from_secs(number * 3600),
            _ => Duration::from_secs(number * 86400),
        };
    }

    if covered != lower.len() {
        return Err(anyhow!(
            "Invalid duration format '{trimmed}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h30m')"
        ));
    }
    if total.is_zero() {
        return Err(anyhow!(
            "Duration must be greater than 0, got '{trimmed}'"
        ));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_kubernetes_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_kubernetes_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_kubernetes_duration("10h").unwrap(), Duration::from_secs(36_000));
        assert_eq!(parse_kubernetes_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_kubernetes_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_compound_and_whitespace() {
        assert_eq!(parse_kubernetes_duration(" 1h30m ").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_kubernetes_duration("1M").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_invalid() {
        for input in ["", "abc", "10", "5x", "m5", "1h 30m", "0s"] {
            assert!(parse_kubernetes_duration(input).is_err(), "{input:?} should be rejected");
        }
    }
}
