use std::borrow::Cow;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::IngestError;

/// Inputs to the timestamp reconciler: everything the client may have sent,
/// plus the server's own clock at receive time.
#[derive(Debug, Clone, Default)]
pub struct TimestampInputs<'a> {
    pub client_timestamp: Option<&'a str>,
    pub sent_at: Option<&'a str>,
    /// Milliseconds, non-negative.
    pub offset: Option<i64>,
}

/// Derives the canonical event timestamp from client-supplied fields and the
/// server's `now`, applying clock-skew correction when both `client_timestamp`
/// and `sent_at` are present. Idempotent: calling this twice with identical
/// inputs (including `now`) yields the same instant.
pub fn reconcile(inputs: &TimestampInputs, now: DateTime<Utc>) -> Result<DateTime<Utc>, IngestError> {
    if let (Some(ts), Some(sent_at)) = (inputs.client_timestamp, inputs.sent_at) {
        match (parse_date(ts), parse_date(sent_at)) {
            (Some(ts), Some(sent_at)) => {
                return Ok(now + (ts - sent_at));
            }
            _ => {
                warn!(
                    timestamp = ts,
                    sent_at = sent_at,
                    "failed to parse timestamp/sent_at for clock-skew correction, falling through"
                );
            }
        }
    }

    if let Some(ts) = inputs.client_timestamp {
        return parse_date(ts)
            .ok_or_else(|| IngestError::InvalidInput(format!("invalid event timestamp: {ts}")));
    }

    if let Some(offset_ms) = inputs.offset {
        if offset_ms < 0 {
            return Err(IngestError::InvalidInput(format!(
                "negative timestamp offset: {offset_ms}"
            )));
        }
        return Ok(now - Duration::milliseconds(offset_ms));
    }

    Ok(now)
}

/// Parses an RFC 3339 timestamp, tolerating the non-standard `+HH`/`-HH`
/// timezone suffix some client SDKs emit, and bare `YYYY-MM-DD` dates (treated
/// as UTC midnight).
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = normalize_timezone_format(raw);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(date) = chrono::NaiveDate::parse_from_str(&normalized, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    None
}

static TIMEZONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?[+-]\d{2}$").unwrap());

fn normalize_timezone_format(input: &str) -> Cow<'_, str> {
    if input.len() < 3 {
        return Cow::Borrowed(input);
    }

    let last_3 = &input[input.len() - 3..];
    if !(last_3.starts_with('+') || last_3.starts_with('-'))
        || !last_3[1..].chars().all(|c| c.is_ascii_digit())
    {
        return Cow::Borrowed(input);
    }

    if TIMEZONE_REGEX.is_match(input) {
        Cow::Owned(format!("{input}:00"))
    } else {
        Cow::Borrowed(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn clock_skew_correction() {
        let inputs = TimestampInputs {
            client_timestamp: Some("2023-12-31T23:59:50Z"),
            sent_at: Some("2023-12-31T23:59:55Z"),
            offset: None,
        };
        let now = dt("2024-01-01T00:00:05Z");
        let result = reconcile(&inputs, now).unwrap();
        assert_eq!(result, dt("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn timestamp_only_is_parsed_directly() {
        let inputs = TimestampInputs {
            client_timestamp: Some("2023-06-01T10:00:00Z"),
            sent_at: None,
            offset: None,
        };
        let result = reconcile(&inputs, dt("2023-06-01T12:00:00Z")).unwrap();
        assert_eq!(result, dt("2023-06-01T10:00:00Z"));
    }

    #[test]
    fn invalid_timestamp_without_sent_at_is_invalid_input() {
        let inputs = TimestampInputs {
            client_timestamp: Some("not-a-date"),
            sent_at: None,
            offset: None,
        };
        let err = reconcile(&inputs, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidInput(_)));
    }

    #[test]
    fn offset_is_subtracted_from_now() {
        let inputs = TimestampInputs {
            client_timestamp: None,
            sent_at: None,
            offset: Some(5_000),
        };
        let now = dt("2024-01-01T00:00:05Z");
        let result = reconcile(&inputs, now).unwrap();
        assert_eq!(result, dt("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn no_fields_falls_back_to_now() {
        let now = dt("2024-01-01T00:00:00Z");
        let result = reconcile(&TimestampInputs::default(), now).unwrap();
        assert_eq!(result, now);
    }

    #[test]
    fn unparseable_pair_falls_through_to_direct_parse_and_still_fails() {
        // Both timestamp and sent_at present but unparseable: rule 1 falls
        // through to rule 2, which re-attempts a direct parse of the same
        // unparseable string and also fails. An `offset` being present does
        // not rescue this — offset is only consulted when client_timestamp
        // is absent (rule 3), not when it is present but malformed.
        let inputs = TimestampInputs {
            client_timestamp: Some("garbage"),
            sent_at: Some("also garbage"),
            offset: Some(1_000),
        };
        let now = dt("2024-01-01T00:00:01Z");
        let err = reconcile(&inputs, now).unwrap_err();
        assert!(matches!(err, IngestError::InvalidInput(_)));
    }

    #[test]
    fn is_idempotent() {
        let inputs = TimestampInputs {
            client_timestamp: Some("2023-12-31T23:59:50Z"),
            sent_at: Some("2023-12-31T23:59:55Z"),
            offset: None,
        };
        let now = dt("2024-01-01T00:00:05Z");
        let first = reconcile(&inputs, now).unwrap();
        let second = reconcile(&inputs, now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn non_standard_timezone_suffix_is_normalized() {
        assert_eq!(
            parse_date("2025-09-17T14:05:04.805+03"),
            parse_date("2025-09-17T14:05:04.805+03:00")
        );
    }

    #[test]
    fn bare_date_is_treated_as_utc_midnight() {
        assert_eq!(parse_date("2023-01-01"), Some(dt("2023-01-01T00:00:00Z")));
    }
}
