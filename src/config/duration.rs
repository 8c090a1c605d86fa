//! Human-readable duration parsing.
//!
//! Configuration durations are written in humantime form (`"500ms"`, `"30s"`,
//! `"2m"`, `"1h 30m"`, `"1d"`) or as a bare number of seconds. They are
//! parsed once, at load time; nothing else in the crate handles duration
//! strings.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use super::ConfigError;

/// Parse a duration string such as `"30s"`, `"2m"` or `"45"` (seconds).
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s)
        .map_err(|e| ConfigError::InvalidDuration(format!("{} ({})", raw, e)))
}

/// Render a duration in a form [`parse_duration`] accepts back.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// Serde adapter: `#[serde(with = "crate::config::duration")]`.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        for d in [
            Duration::from_millis(250),
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::from_secs(7200),
            Duration::from_millis(90_500),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_serde_accepts_integer_seconds_and_text() {
        #[derive(Deserialize, serde::Serialize)]
        struct Holder {
            #[serde(with = "crate::config::duration")]
            every: Duration,
        }
        let from_int: Holder = serde_yaml::from_str("every: 15").unwrap();
        assert_eq!(from_int.every, Duration::from_secs(15));
        let from_text: Holder = serde_yaml::from_str("every: 2m").unwrap();
        assert_eq!(from_text.every, Duration::from_secs(120));
        assert!(serde_yaml::from_str::<Holder>("every: soon").is_err());

        let rendered = serde_yaml::to_string(&from_text).unwrap();
        assert_eq!(rendered.trim(), "every: 2m");
    }
}
