use chrono::{Duration, NaiveDateTime};

/// The tool prints and accepts timestamps as `YYYY:mm:dd HH:MM:SS`, with an
/// optional fractional-second part and an optional `+HH:MM` / `-HH:MM` / `Z`
/// zone suffix.
const TOOL_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Shifts a timestamp value by a signed number of seconds, preserving any
/// fractional seconds and zone suffix verbatim.
///
/// Returns `None` for values that are not full timestamps (`1/250`, `Apple`,
/// date-only stamps, the all-zero placeholder), which callers treat as
/// "leave this tag alone".
pub fn shift_capture_value(value: &str, offset_seconds: i64) -> Option<String> {
    let trimmed = value.trim();
    let (rest, timezone) = split_timezone(trimmed);
    let (core, subseconds) = split_subseconds(rest);

    let parsed = NaiveDateTime::parse_from_str(core, TOOL_DATETIME_FORMAT).ok()?;
    let shifted = parsed.checked_add_signed(Duration::try_seconds(offset_seconds)?)?;

    let mut rendered = shifted.format(TOOL_DATETIME_FORMAT).to_string();
    if let Some(fraction) = subseconds {
        rendered.push('.');
        rendered.push_str(fraction);
    }
    if let Some(suffix) = timezone {
        rendered.push_str(suffix);
    }
    Some(rendered)
}

/// Parses the naive portion of a tool timestamp, ignoring fractional seconds
/// and any zone suffix.
pub fn parse_capture_value(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim();
    let (rest, _) = split_timezone(trimmed);
    let (core, _) = split_subseconds(rest);
    NaiveDateTime::parse_from_str(core, TOOL_DATETIME_FORMAT).ok()
}

/// Signed seconds to add to `sample` to land on `reference`.
pub fn offset_between(reference: &str, sample: &str) -> Option<i64> {
    let reference = parse_capture_value(reference)?;
    let sample = parse_capture_value(sample)?;
    Some((reference - sample).num_seconds())
}

/// Whether a metadata key names a capture-related timestamp worth shifting.
///
/// The filter is deliberately broad (`ExposureTime` and friends slip
/// through); non-timestamp values fail to parse and are skipped one level
/// down. Filesystem bookkeeping stamps the OS rewrites on its own are
/// excluded outright.
pub fn is_capture_time_key(key: &str) -> bool {
    const FILESYSTEM_MANAGED: &[&str] = &["FileAccessDate", "FileInodeChangeDate"];
    if FILESYSTEM_MANAGED.contains(&key) {
        return false;
    }
    let lowered = key.to_ascii_lowercase();
    lowered.contains("date") || lowered.contains("time")
}

/// `3725` becomes `+1h 2m 5s`; zero is "no change".
pub fn describe_offset(offset_seconds: i64) -> String {
    if offset_seconds == 0 {
        return "no change".to_string();
    }
    let sign = if offset_seconds < 0 { '-' } else { '+' };
    let mut remainder = offset_seconds.unsigned_abs();

    let mut parts = Vec::new();
    for (unit, seconds) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        let amount = remainder / seconds;
        if amount > 0 {
            parts.push(format!("{amount}{unit}"));
            remainder %= seconds;
        }
    }
    format!("{sign}{}", parts.join(" "))
}

fn split_timezone(value: &str) -> (&str, Option<&str>) {
    if let Some(rest) = value.strip_suffix('Z') {
        return (rest, Some("Z"));
    }
    // Anchored check for `±HH:MM`; a loose scan would eat the date part.
    if value.len() > 6 && value.is_char_boundary(value.len() - 6) {
        let (head, tail) = value.split_at(value.len() - 6);
        let bytes = tail.as_bytes();
        if (bytes[0] == b'+' || bytes[0] == b'-')
            && bytes[1].is_ascii_digit()
            && bytes[2].is_ascii_digit()
            && bytes[3] == b':'
            && bytes[4].is_ascii_digit()
            && bytes[5].is_ascii_digit()
        {
            return (head, Some(tail));
        }
    }
    (value, None)
}

fn split_subseconds(value: &str) -> (&str, Option<&str>) {
    match value.rsplit_once('.') {
        Some((head, fraction))
            if !fraction.is_empty() && fraction.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (head, Some(fraction))
        }
        _ => (value, None),
    }
}
