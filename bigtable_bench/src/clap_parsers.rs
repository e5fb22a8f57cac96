use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseDurationError {
    #[error("error parsing number in duration")]
    Number,
    #[error("error parsing unit in duration (valid units are: ns, µs/us, ms, s)")]
    Unit,
}

/// Accepts input like "5ms" or "1.5 s".
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let number = f64::from_str(number).map_err(|_| ParseDurationError::Number)?;
    let scale = match unit.strip_prefix(' ').unwrap_or(unit) {
        "ns" => 1.0,
        "µs" | "us" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        _ => return Err(ParseDurationError::Unit),
    };
    Ok(Duration::from_nanos((number * scale).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(Ok(Duration::from_millis(5)), parse_duration("5ms"));
        assert_eq!(Ok(Duration::from_millis(1500)), parse_duration("1.5 s"));
        assert_eq!(Ok(Duration::from_micros(250)), parse_duration("250 µs"));
        assert_eq!(Ok(Duration::from_nanos(7)), parse_duration("7ns"));
        assert_eq!(Ok(Duration::ZERO), parse_duration("0s"));
    }

    #[test]
    fn test_parse_duration_errors() {
        use ParseDurationError::{Number, Unit};
        for (err, input) in [
            (Number, ""),
            (Number, "ms"),
            (Number, "1.2.3 s"),
            (Unit, "10"),
            (Unit, "3 fortnights"),
            (Unit, "3  s"),
        ] {
            assert_eq!(Err(err), parse_duration(input), "{input:?}");
        }
    }
}
