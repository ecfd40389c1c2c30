use std::fmt::Display;

use jiff::civil::{Date, DateTime};
use log::info;

use crate::{
    mailbox::{MailSession, MailboxAccess, SequencePosition, SessionError},
    resolver::{SearchMode, resolve},
};

/// Inclusive span of positions to act on, computed once before anything is
/// mutated. Empty when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRange {
    start: u32,
    end: u32,
}

impl DeletionRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn empty() -> Self {
        Self { start: 1, end: 0 }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end || self.start == 0
    }

    pub fn len(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn start_position(&self) -> Option<SequencePosition> {
        if self.is_empty() {
            None
        } else {
            SequencePosition::try_from(self.start).ok()
        }
    }
}

impl Display for DeletionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "nothing")
        } else {
            write!(f, "{} to {}", self.start, self.end)
        }
    }
}

/// Which messages a run is about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Everything dated before the cutoff.
    Before(DateTime),
    /// Everything dated in the calendar years `first..=last`.
    Years { first: i16, last: i16 },
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Before(cutoff) => write!(f, "before {}", cutoff.date()),
            Self::Years { first, last } if first == last => write!(f, "year {first}"),
            Self::Years { first, last } => write!(f, "years {first}-{last}"),
        }
    }
}

/// Midnight of January 1st, `None` for years outside the calendar.
fn start_of_year(year: i16) -> Option<DateTime> {
    Date::new(year, 1, 1).ok().map(|date| date.at(0, 0, 0, 0))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Survey {
    pub count: u32,
    pub oldest: Option<DateTime>,
    pub newest: Option<DateTime>,
    pub range: DeletionRange,
}

/// Looks at the mailbox in one session that is never committed and works out
/// which positions `target` covers.
pub async fn survey<A: MailboxAccess>(access: &A, target: &Target) -> Result<Survey, SessionError> {
    let mut session = access.open().await?;
    let result = survey_session(&mut session, target).await;
    session.close().await;
    result
}

async fn survey_session<S: MailSession>(
    session: &mut S,
    target: &Target,
) -> Result<Survey, SessionError> {
    let count = session.count().await?;
    info!("mailbox has {count} messages");
    let (Ok(first), Ok(last)) = (
        SequencePosition::try_from(1),
        SequencePosition::try_from(count),
    ) else {
        return Ok(Survey {
            count,
            oldest: None,
            newest: None,
            range: DeletionRange::empty(),
        });
    };

    let oldest = session.message_date(first).await?;
    let newest = session.message_date(last).await?;
    let range = deletion_range(session, count, target, oldest, newest).await?;

    Ok(Survey {
        count,
        oldest,
        newest,
        range,
    })
}

/// Positions covered by `target`. Known extreme dates skip searches whose
/// answer they already give.
pub async fn deletion_range<S: MailSession>(
    session: &mut S,
    count: u32,
    target: &Target,
    oldest: Option<DateTime>,
    newest: Option<DateTime>,
) -> Result<DeletionRange, SessionError> {
    match *target {
        Target::Before(cutoff) => {
            if oldest.is_some_and(|oldest| cutoff <= oldest) {
                info!("cutoff {} is not after the oldest message", cutoff.date());
                return Ok(DeletionRange::empty());
            }
            if newest.is_some_and(|newest| cutoff > newest) {
                info!("cutoff {} is after the newest message", cutoff.date());
                return Ok(DeletionRange::new(1, count));
            }

            let boundary = resolve(session, count, cutoff, SearchMode::FirstGte).await?;
            if boundary <= 1 {
                Ok(DeletionRange::empty())
            } else {
                Ok(DeletionRange::new(1, boundary - 1))
            }
        }
        Target::Years { first, last } => {
            if first > last {
                return Ok(DeletionRange::empty());
            }
            let start = if oldest.is_some_and(|oldest| first <= oldest.year()) {
                info!("oldest message is from {first} or later, starting at 1");
                1
            } else {
                match start_of_year(first) {
                    Some(from) => resolve(session, count, from, SearchMode::FirstGte).await?,
                    // before the calendar starts
                    None if first < 0 => 1,
                    None => return Ok(DeletionRange::empty()),
                }
            };

            let end = if newest.is_some_and(|newest| last >= newest.year()) {
                info!("newest message is from {last} or earlier, ending at {count}");
                count
            } else {
                match last.checked_add(1).and_then(start_of_year) {
                    Some(until) => {
                        resolve(session, count, until, SearchMode::FirstGte).await? - 1
                    }
                    // past the end of the calendar
                    None if last > 0 => count,
                    None => return Ok(DeletionRange::empty()),
                }
            };

            if start > end || start > count {
                Ok(DeletionRange::empty())
            } else {
                Ok(DeletionRange::new(start, end))
            }
        }
    }
}
