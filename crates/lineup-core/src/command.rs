use chrono::TimeDelta;
use thiserror::Error;

/// Reply sent when a poll request cannot be parsed.
pub const USAGE: &str = "Usage: /poll Topic | 30m  (duration like 10m, 1h, 1h30m). \
     Example: /poll Math practice | 45m";

/// A parsed "create poll" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub topic: String,
    pub duration: TimeDelta,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty poll request")]
    Empty,
    #[error("bad format: expected 'Topic | duration'")]
    BadFormat,
    #[error("bad duration '{0}'")]
    BadDuration(String),
}

/// Split `Topic | 30m` (or `Topic 30m`, splitting on the last whitespace)
/// into a topic and a duration.
pub fn parse_request(text: &str) -> Result<PollRequest, ParseError> {
    let raw = text.trim();
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    let (topic, duration) = match raw.split_once('|') {
        Some(parts) => parts,
        None => raw
            .rsplit_once(char::is_whitespace)
            .ok_or(ParseError::BadFormat)?,
    };

    let topic = topic.trim();
    if topic.is_empty() {
        return Err(ParseError::BadFormat);
    }

    Ok(PollRequest {
        topic: topic.to_string(),
        duration: parse_duration(duration.trim())?,
    })
}

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Units, longest spelling first so `ms` wins over `m`.
const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("h", 3_600 * NANOS_PER_SECOND),
    ("m", 60 * NANOS_PER_SECOND),
    ("s", NANOS_PER_SECOND),
];

/// Parse a duration such as `45m`, `1h30m` or `1.5h`.
///
/// A sequence of decimal numbers, each with a unit suffix. Signs and bare
/// numbers are rejected. The result is truncated to whole seconds and must be
/// at least one second.
pub fn parse_duration(s: &str) -> Result<TimeDelta, ParseError> {
    let bad = || ParseError::BadDuration(s.to_string());

    if s.is_empty() {
        return Err(bad());
    }

    let mut rest = s;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_num) = match after_int.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after_dot.len());
                after_dot.split_at(frac_len)
            }
            None => ("", after_int),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }

        let (unit, scale) = UNITS
            .iter()
            .find(|(name, _)| after_num.starts_with(name))
            .ok_or_else(bad)?;
        rest = &after_num[unit.len()..];

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| bad())?
        };
        let mut value = whole.checked_mul(*scale).ok_or_else(bad)?;

        // Digits beyond nanosecond precision cannot change the result.
        let frac_digits = &frac_part[..frac_part.len().min(18)];
        if !frac_digits.is_empty() {
            let frac: u128 = frac_digits.parse().map_err(|_| bad())?;
            let denom = 10u128.pow(frac_digits.len() as u32);
            value = value.checked_add(frac * scale / denom).ok_or_else(bad)?;
        }

        total = total.checked_add(value).ok_or_else(bad)?;
        if total > i64::MAX as u128 {
            return Err(bad());
        }
    }

    let seconds = (total / NANOS_PER_SECOND) as i64;
    if seconds < 1 {
        return Err(bad());
    }
    Ok(TimeDelta::seconds(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipe_form() {
        let req = parse_request("  Math practice | 45m ").unwrap();
        assert_eq!(req.topic, "Math practice");
        assert_eq!(req.duration, TimeDelta::minutes(45));
    }

    #[test]
    fn test_parse_last_space_form() {
        let req = parse_request("Practice at the gym 1h").unwrap();
        assert_eq!(req.topic, "Practice at the gym");
        assert_eq!(req.duration, TimeDelta::hours(1));
    }

    #[test]
    fn test_pipe_wins_over_spaces() {
        let req = parse_request("Lunch 2 | 30m").unwrap();
        assert_eq!(req.topic, "Lunch 2");
        assert_eq!(req.duration, TimeDelta::minutes(30));
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(parse_request("   "), Err(ParseError::Empty));
        assert_eq!(parse_request("Practice"), Err(ParseError::BadFormat));
        assert_eq!(parse_request(" | 30m"), Err(ParseError::BadFormat));
        assert_eq!(
            parse_request("just text no duration"),
            Err(ParseError::BadDuration("duration".into()))
        );
        assert_eq!(
            parse_request("Practice | soon"),
            Err(ParseError::BadDuration("soon".into()))
        );
    }

    #[test]
    fn test_duration_grammar() {
        assert_eq!(parse_duration("30m").unwrap(), TimeDelta::minutes(30));
        assert_eq!(parse_duration("1h30m").unwrap(), TimeDelta::minutes(90));
        assert_eq!(parse_duration("1.5h").unwrap(), TimeDelta::minutes(90));
        assert_eq!(parse_duration("90s").unwrap(), TimeDelta::seconds(90));
        assert_eq!(parse_duration("1500ms").unwrap(), TimeDelta::seconds(1));
        assert_eq!(parse_duration(".5m").unwrap(), TimeDelta::seconds(30));
        assert_eq!(parse_duration("2h0m5s").unwrap(), TimeDelta::seconds(7205));
    }

    #[test]
    fn test_duration_rejects() {
        for input in ["", "0s", "250ms", "-5m", "+5m", "10", "abc", "5x", "m", "1.m5", "1h 30m", "."] {
            assert!(parse_duration(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_duration_overflow_is_rejected() {
        assert!(parse_duration("99999999999999999999999h").is_err());
        assert!(parse_duration("3000000h").is_err());
    }
}
