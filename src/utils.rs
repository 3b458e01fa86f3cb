use std::time::Duration;
use crate::errors::{Result, ManagerError};

/// Parse a duration string like "500ms", "5s", "1m" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.trim().is_empty() {
        return Err(ManagerError::config("Empty duration string"));
    }

    humantime::parse_duration(s.trim())
        .map_err(|e| ManagerError::config(format!("Invalid duration '{}': {}", s, e)))
}

/// Camera ids travel as the RTMP stream name. Anything that is not a plain
/// integer (optionally signed, surrounded by whitespace) is not a camera.
pub fn parse_stream_name(name: &str) -> Option<i64> {
    name.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("   ").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_stream_name() {
        assert_eq!(parse_stream_name("42"), Some(42));
        assert_eq!(parse_stream_name(" 7\n"), Some(7));
        assert_eq!(parse_stream_name("+3"), Some(3));
        assert_eq!(parse_stream_name("-1"), Some(-1));

        assert_eq!(parse_stream_name(""), None);
        assert_eq!(parse_stream_name("stream1"), None);
        assert_eq!(parse_stream_name("4.2"), None);
    }
}
