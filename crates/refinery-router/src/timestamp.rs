// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event timestamp parsing.
//!
//! Clients send timestamps in several shapes and there is no content-type to
//! disambiguate them, so we guess in a fixed order:
//!
//! * RFC3339, with or without fractional seconds
//! * all digits: integer unix epoch; exactly 10 digits are seconds, longer
//!   strings are seconds followed by fractional digits (millis, micros, ...)
//! * a float: seconds with a fractional part
//!
//! Anything else resolves to "unset" and downstream policy substitutes the
//! server time at ingest. All results are normalized to UTC.

use chrono::{DateTime, TimeZone, Utc};

const EPOCH_SECONDS_DIGITS: usize = 10;

/// Parses a timestamp header or batch-record value. `None` means unset.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        if raw.len() == EPOCH_SECONDS_DIGITS {
            let secs = raw.parse::<i64>().ok()?;
            return Utc.timestamp_opt(secs, 0).single();
        }
        if raw.len() > EPOCH_SECONDS_DIGITS {
            // seconds followed by fractional digits: 13 digits are millis,
            // 16 are micros, and so on
            let fractional = format!(
                "{}.{}",
                &raw[..EPOCH_SECONDS_DIGITS],
                &raw[EPOCH_SECONDS_DIGITS..]
            );
            return fractional.parse::<f64>().ok().and_then(from_epoch_f64);
        }
        // too short to be an epoch we recognize
        return None;
    }

    raw.parse::<f64>().ok().and_then(from_epoch_f64)
}

/// Splits a float epoch into whole seconds and nanoseconds.
pub fn from_epoch_f64(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let mut secs = epoch.trunc() as i64;
    let mut nanos = (epoch.fract() * 1e9).round() as u32;
    if nanos >= 1_000_000_000 {
        secs += 1;
        nanos = 0;
    }
    Utc.timestamp_opt(secs, nanos).single()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_with_nanos_round_trips() {
        let ts = parse_event_time("2023-11-14T22:13:20.123456789Z").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn rfc3339_offset_normalizes_to_utc() {
        let ts = parse_event_time("2023-11-14T17:13:20-05:00").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn ten_digit_epoch_is_seconds() {
        let ts = parse_event_time("1700000000").unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn thirteen_digit_epoch_is_milliseconds() {
        let ts = parse_event_time("1700000000123").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn float_epoch_keeps_fraction() {
        let ts = parse_event_time("1700000000.5").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn unparseable_inputs_are_unset() {
        assert!(parse_event_time("").is_none());
        assert!(parse_event_time("yesterday").is_none());
        // a short all-digit string is not a recognizable epoch
        assert!(parse_event_time("12345").is_none());
    }
}
