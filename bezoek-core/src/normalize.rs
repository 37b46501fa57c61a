//! Canonical forms for license plates and timestamps, plus the shared
//! reservation-window and zone-validity rules.
//!
//! Everything crossing the provider boundary goes through these functions:
//! plates become stripped uppercase, timestamps become UTC with zero
//! sub-seconds, and free parking windows are filtered out before results
//! reach the caller.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::BezoekError;
use crate::model::ZoneValidityBlock;

/// Normalize a license plate to its canonical form: uppercase with every
/// character outside `A-Z0-9` removed.
///
/// # Errors
///
/// Returns [`BezoekError::Validation`] when nothing remains after stripping.
pub fn normalize_license_plate(plate: &str) -> Result<String, BezoekError> {
    let normalized: String = plate
        .chars()
        .flat_map(char::to_uppercase)
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if normalized.is_empty() {
        return Err(BezoekError::Validation(String::from(
            "License plate is empty after normalization.",
        )));
    }
    Ok(normalized)
}

/// Mask a license plate for display and logging.
///
/// Plates that do not normalize render as `***`. Short plates are fully
/// masked; longer plates keep one or two characters on each end.
#[must_use]
pub fn mask_license_plate(plate: &str) -> String {
    let Ok(normalized) = normalize_license_plate(plate) else {
        return String::from("***");
    };
    let chars: Vec<char> = normalized.chars().collect();
    let masked = |count: usize| "*".repeat(count);
    match chars.as_slice() {
        short @ ([] | [_] | [_, _]) => masked(short.len()),
        [first, _, last] => format!("{first}*{last}"),
        [first, _, _, last] => format!("{first}**{last}"),
        [a, b, middle @ .., y, z] => format!("{a}{b}{}{y}{z}", masked(middle.len())),
    }
}

/// Parse an ISO 8601 timestamp that carries an explicit offset or a trailing
/// `Z`, converting it to UTC and truncating sub-second precision.
///
/// # Errors
///
/// Returns [`BezoekError::Validation`] when the value is empty, is not valid
/// ISO 8601, or carries no timezone information.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, BezoekError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BezoekError::Validation(String::from(
            "Timestamp must be a non-empty string.",
        )));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(truncate_subseconds(parsed.with_timezone(&Utc)));
    }
    // Some backends separate date and time with a space instead of `T`.
    if trimmed.contains(' ')
        && let Ok(parsed) = DateTime::parse_from_rfc3339(&trimmed.replacen(' ', "T", 1))
    {
        return Ok(truncate_subseconds(parsed.with_timezone(&Utc)));
    }
    if parses_as_naive(trimmed) {
        return Err(BezoekError::Validation(String::from(
            "Timestamp must include timezone information.",
        )));
    }
    Err(BezoekError::Validation(String::from(
        "Timestamp is not a valid ISO 8601 value.",
    )))
}

/// Render a timestamp in canonical form: UTC, zero sub-seconds, trailing `Z`.
#[must_use]
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    truncate_subseconds(value).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Validate a reservation window.
///
/// With `require_both`, both endpoints must be present. Whenever both are
/// present, `end` must be strictly after `start`. Returned values have
/// sub-seconds truncated.
///
/// # Errors
///
/// Returns [`BezoekError::Validation`] when an endpoint is missing or the
/// window is not strictly increasing.
pub fn validate_reservation_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    require_both: bool,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), BezoekError> {
    if require_both && (start.is_none() || end.is_none()) {
        return Err(BezoekError::Validation(String::from(
            "start_time and end_time are required.",
        )));
    }
    let start = start.map(truncate_subseconds);
    let end = end.map(truncate_subseconds);
    if let (Some(start_at), Some(end_at)) = (start, end)
        && end_at <= start_at
    {
        return Err(BezoekError::Validation(String::from(
            "end_time must be after start_time.",
        )));
    }
    Ok((start, end))
}

/// Keep only chargeable blocks, preserving their order.
#[must_use]
pub fn filter_chargeable<I>(entries: I) -> Vec<ZoneValidityBlock>
where
    I: IntoIterator<Item = (ZoneValidityBlock, bool)>,
{
    entries
        .into_iter()
        .filter_map(|(block, is_chargeable)| is_chargeable.then_some(block))
        .collect()
}

/// Interpret a naive civil time in the given zone and convert it to UTC.
///
/// An ambiguous local time (clocks falling back) resolves to its first
/// occurrence. A nonexistent local time (spring-forward gap) is interpreted
/// with the pre-transition offset; the one-hour probe covers standard DST
/// transitions.
#[must_use]
pub fn local_naive_to_utc(naive: NaiveDateTime, zone: Tz) -> DateTime<Utc> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(resolved) => resolved.with_timezone(&Utc),
        LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        LocalResult::None => {
            let probe = naive - TimeDelta::hours(1);
            let base = match zone.from_local_datetime(&probe) {
                LocalResult::Single(resolved) | LocalResult::Ambiguous(resolved, _) => {
                    resolved.with_timezone(&Utc)
                }
                LocalResult::None => Utc.from_utc_datetime(&probe),
            };
            base + TimeDelta::hours(1)
        }
    }
}

/// Drop sub-second precision, the resolution of the canonical form.
#[must_use]
pub fn truncate_subseconds(value: DateTime<Utc>) -> DateTime<Utc> {
    value.with_nanosecond(0).unwrap_or(value)
}

fn parses_as_naive(value: &str) -> bool {
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(value, format).is_ok())
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}
