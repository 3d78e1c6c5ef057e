//! Date helpers behind `utils.date` inside the sandbox.
//!
//! Accepted inputs (case-insensitive):
//!
//! - RFC 3339 timestamps: `2024-11-16T08:00:00+11:00`
//! - calendar dates with optional time: `2024-11-16`, `2024-11-16 09:30[:15]`
//! - `now`, `today`, `tomorrow`, `yesterday`, optionally followed by a time
//!   (`tomorrow 0:00`, `today at 17:30`); without a time the day starts at 00:00
//! - relative offsets: `in 15 minutes`, `in 2 hours`, `in 3 days`
//!
//! Time zones are IANA names (`America/New_York`), `UTC`, or fixed offsets
//! such as `+05:30`. Local times that fall in a DST gap move forward by an
//! hour; ambiguous ones take the earlier instant.

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    SecondsFormat, TimeZone, Utc,
};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;

static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:UTC|GMT)?([+-])(\d{1,2})(?::?(\d{2}))?$").expect("valid regex")
});

static CALENDAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})(?:[ t](\d{1,2}:\d{2}(?::\d{2})?))?$").expect("valid regex")
});

static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(now|today|tomorrow|yesterday)(?:\s+(?:at\s+)?(\d{1,2}:\d{2}(?::\d{2})?))?$")
        .expect("valid regex")
});

static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^in\s+(\d+)\s+(minute|hour|day)s?$").expect("valid regex")
});

/// A time zone accepted by `utils.date`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

/// Resolve an IANA name or a fixed offset.
pub fn parse_time_zone(tz: &str) -> Result<Zone, String> {
    let tz = tz.trim();
    if tz.is_empty() || matches!(tz.to_ascii_uppercase().as_str(), "UTC" | "GMT" | "Z") {
        return Ok(Zone::Fixed(Utc.fix()));
    }
    if let Ok(named) = tz.parse::<Tz>() {
        return Ok(Zone::Named(named));
    }

    let unsupported = || {
        format!("Unsupported time zone '{tz}': use an IANA name or a fixed offset like +05:30")
    };
    let caps = OFFSET_RE.captures(tz).ok_or_else(unsupported)?;
    let hours: i32 = caps[2].parse().map_err(|_| unsupported())?;
    let minutes: i32 = caps
        .get(3)
        .map_or(Ok(0), |m| m.as_str().parse())
        .map_err(|_| unsupported())?;
    let seconds = (hours * 3600 + minutes * 60) * if &caps[1] == "-" { -1 } else { 1 };

    FixedOffset::east_opt(seconds)
        .map(Zone::Fixed)
        .ok_or_else(unsupported)
}

fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn local_to_utc<Z: TimeZone>(zone: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&naive)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|d| d.with_timezone(&Utc))
}

/// Parse `input` relative to `now` in time zone `tz`.
///
/// `Ok(None)` means the input was not understood; an unsupported time zone
/// is an error.
pub fn parse_date(input: &str, tz: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    Ok(match parse_time_zone(tz)? {
        Zone::Named(zone) => parse_in(input, &zone, now),
        Zone::Fixed(offset) => parse_in(input, &offset, now),
    })
}

fn parse_in<Z: TimeZone>(input: &str, zone: &Z, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed.with_timezone(&Utc));
    }
    let input = input.to_ascii_lowercase();

    if let Some(caps) = CALENDAR_RE.captures(&input) {
        let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") else {
            return None;
        };
        let time = match caps.get(2) {
            Some(t) => parse_clock(t.as_str())?,
            None => NaiveTime::MIN,
        };
        return local_to_utc(zone, date.and_time(time));
    }

    if let Some(caps) = KEYWORD_RE.captures(&input) {
        let keyword = &caps[1];
        if keyword == "now" && caps.get(2).is_none() {
            return Some(now);
        }
        let today = now.with_timezone(zone).date_naive();
        let day = match keyword {
            "tomorrow" => today + Duration::days(1),
            "yesterday" => today - Duration::days(1),
            _ => today,
        };
        let time = match caps.get(2) {
            Some(t) => parse_clock(t.as_str())?,
            None => NaiveTime::MIN,
        };
        return local_to_utc(zone, day.and_time(time));
    }

    if let Some(caps) = RELATIVE_RE.captures(&input) {
        let Ok(amount) = caps[1].parse::<i64>() else {
            return None;
        };
        let delta = match &caps[2] {
            "minute" => Duration::try_minutes(amount),
            "hour" => Duration::try_hours(amount),
            _ => Duration::try_days(amount),
        };
        return delta.and_then(|d| now.checked_add_signed(d));
    }

    None
}

/// Parse a start/end pair. When the end is not after the start, the end
/// becomes the last millisecond of the start's UTC day.
pub fn parse_start_and_end(
    start: &str,
    end: &str,
    tz: &str,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    if start.trim().is_empty() || end.trim().is_empty() {
        return Err("Start and end inputs must be provided.".to_string());
    }

    let invalid = || "Invalid date input. Please check your start and end inputs.".to_string();
    let start_date = parse_date(start, tz, now)?.ok_or_else(invalid)?;
    let mut end_date = parse_date(end, tz, now)?.ok_or_else(invalid)?;

    if end_date <= start_date {
        let end_of_day = start_date
            .date_naive()
            .and_hms_milli_opt(23, 59, 59, 999)
            .ok_or_else(invalid)?;
        end_date = end_of_day.and_utc();
    }

    Ok((start_date, end_date))
}

/// ISO 8601 in UTC with millisecond precision, as `Date.prototype.toISOString` prints it.
pub fn to_iso_string(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}
