//! Parsing of the response `Retry-After` header (RFC 7231 §7.1.3).

use std::time::{Duration, SystemTime};

use http::HeaderMap;

/// Caps an absurdly large `Retry-After` so a malicious or buggy server
/// cannot park a retry sequence for hours.
const MAX_SECONDS: u64 = 3600;

/// Parses `Retry-After` as either delta-seconds or an HTTP-date, returning
/// the resulting delay from now. A date in the past yields `Duration::ZERO`
/// rather than `None`, since §6 of the spec treats "no further retry" as a
/// deadline-comparison concern, not a parse failure.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?;
    let s = value.to_str().ok()?.trim();

    if let Ok(seconds) = s.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(MAX_SECONDS)));
    }

    if let Ok(date) = httpdate::parse_http_date(s) {
        let now = SystemTime::now();
        let delay = date.duration_since(now).unwrap_or(Duration::ZERO);
        return Some(delay.min(Duration::from_secs(MAX_SECONDS)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn parses_http_date_in_future() {
        let future = SystemTime::now() + Duration::from_secs(60);
        let formatted = httpdate::fmt_http_date(future);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_str(&formatted).unwrap());
        let delay = parse_retry_after(&headers).unwrap();
        // httpdate truncates to whole seconds, allow a little slack.
        assert!(delay >= Duration::from_secs(58) && delay <= Duration::from_secs(60));
    }

    #[test]
    fn past_date_yields_zero() {
        let past = SystemTime::now() - Duration::from_secs(60);
        let formatted = httpdate::fmt_http_date(past);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_str(&formatted).unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn absent_header_yields_none() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn caps_absurd_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("999999999"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(MAX_SECONDS)));
    }
}
