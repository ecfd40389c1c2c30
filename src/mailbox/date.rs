use jiff::civil::DateTime;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DateParseError {
    #[error("message has no Date header")]
    Missing,
    #[error("unparseable Date header {0:?}")]
    Unparseable(String),
}

/// Reads the `Date:` header out of a raw header block (or a full message) and
/// returns the sender's wall clock time with the offset dropped.
pub fn message_date(raw: &[u8]) -> Result<DateTime, DateParseError> {
    let value = header_value(raw, "date").ok_or(DateParseError::Missing)?;
    parse_date(&value)
}

pub fn parse_date(value: &str) -> Result<DateTime, DateParseError> {
    let mut cleaned = value.trim();
    // trailing zone comment like "(UTC)" or "(Pacific Standard Time)"
    if cleaned.ends_with(')') {
        if let Some(open) = cleaned.rfind('(') {
            cleaned = cleaned[..open].trim_end();
        }
    }
    // the weekday is redundant and frequently wrong, so it is not checked
    if let Some((weekday, rest)) = cleaned.split_once(',') {
        if weekday.trim().chars().all(|c| c.is_ascii_alphabetic()) {
            cleaned = rest.trim_start();
        }
    }

    jiff::fmt::rfc2822::parse(cleaned)
        .map(|zoned| zoned.datetime())
        .map_err(|_| DateParseError::Unparseable(value.trim().to_string()))
}

fn header_value(raw: &[u8], wanted: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut found: Option<String> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some(value) = found.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if found.is_some() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(wanted) {
                found = Some(value.trim().to_string());
            }
        }
    }

    found
}
