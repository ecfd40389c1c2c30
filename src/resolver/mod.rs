mod range;

use jiff::civil::DateTime;
use log::{debug, warn};

use crate::mailbox::{MailSession, SequencePosition, SessionError};

pub use range::DeletionRange;
pub use range::Survey;
pub use range::Target;
pub use range::deletion_range;
pub use range::survey;

/// Neighbors tried, in order, when a candidate has no usable date.
const PROBE_OFFSETS: [i64; 6] = [1, -1, 2, -2, 5, -5];
/// How far the low bound jumps when no date is found around a candidate.
const SKIP_AHEAD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// First position dated at or after the target, `count + 1` if none is.
    FirstGte,
    /// Last position dated before the target, `0` if none is.
    LastLt,
}

/// Binary searches positions `1..=count` for the point where dates cross
/// `target`, reading only one header per probe.
///
/// Assumes dates do not decrease with position. Mailboxes mostly but not
/// always keep that order, so the result is approximate around messages that
/// arrived out of order.
pub async fn resolve<S: MailSession>(
    session: &mut S,
    count: u32,
    target: DateTime,
    mode: SearchMode,
) -> Result<u32, SessionError> {
    debug!("binary searching {count} messages for {mode:?} {target}");
    let mut left = 1;
    let mut right = count;
    let mut result = match mode {
        SearchMode::FirstGte => count.saturating_add(1),
        SearchMode::LastLt => 0,
    };

    let mut iterations = 0;
    while left <= right {
        iterations += 1;
        let mid = left + (right - left) / 2;

        let Some((position, date)) = dated_near(session, mid, left, right, count).await? else {
            debug!("#{mid}: no date nearby, skipping ahead");
            left = mid.saturating_add(SKIP_AHEAD);
            continue;
        };

        let before = date < target;
        debug!(
            "#{position}: {} {} target",
            date.date(),
            if before { "<" } else { ">=" }
        );
        match (mode, before) {
            (SearchMode::FirstGte, false) | (SearchMode::LastLt, true) => result = position,
            _ => {}
        }
        if before {
            left = position + 1;
        } else {
            right = position - 1;
        }
    }

    debug!("binary search complete in {iterations} iterations: {result}");
    if !check_boundary(session, count, target, mode, result).await? {
        warn!("boundary #{result} is approximate, messages around it are out of date order");
    }
    Ok(result)
}

/// Date of `mid`, or of the first neighbor inside `left..=right` that has one.
async fn dated_near<S: MailSession>(
    session: &mut S,
    mid: u32,
    left: u32,
    right: u32,
    count: u32,
) -> Result<Option<(u32, DateTime)>, SessionError> {
    let Ok(mid) = SequencePosition::try_from(mid) else {
        return Ok(None);
    };
    if let Some(date) = session.message_date(mid).await? {
        return Ok(Some((mid.get(), date)));
    }

    debug!("#{mid}: no date, trying neighbors");
    for offset in PROBE_OFFSETS {
        let Some(probe) = mid.offset(offset, count) else {
            continue;
        };
        if !(left..=right).contains(&probe.get()) {
            continue;
        }
        if let Some(date) = session.message_date(probe).await? {
            return Ok(Some((probe.get(), date)));
        }
    }

    Ok(None)
}

// Re-reads the two positions straddling the boundary. False means the mailbox
// is not in date order around it; the boundary is kept anyway.
async fn check_boundary<S: MailSession>(
    session: &mut S,
    count: u32,
    target: DateTime,
    mode: SearchMode,
    boundary: u32,
) -> Result<bool, SessionError> {
    let (last_before, first_after) = match mode {
        SearchMode::FirstGte => (boundary.checked_sub(1), boundary),
        SearchMode::LastLt => (Some(boundary), boundary.saturating_add(1)),
    };

    let mut in_order = true;
    if let Some(position) = last_before.and_then(|p| SequencePosition::try_from(p).ok()) {
        if let Some(date) = session.message_date(position).await? {
            if date >= target {
                debug!("#{position} dated {date} is not before {target}");
                in_order = false;
            }
        }
    }
    if first_after <= count {
        if let Ok(position) = SequencePosition::try_from(first_after) {
            if let Some(date) = session.message_date(position).await? {
                if date < target {
                    debug!("#{position} dated {date} is before {target}");
                    in_order = false;
                }
            }
        }
    }

    Ok(in_order)
}
