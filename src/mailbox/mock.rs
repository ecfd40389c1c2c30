use std::{
    cell::RefCell,
    collections::{BTreeSet, HashSet},
    fmt,
    rc::Rc,
};

use bytes::Bytes;
use jiff::civil::DateTime;

use crate::mailbox::{MailSession, MailboxAccess, SequencePosition, SessionError, message_date};

type CommitObserver = Box<dyn FnMut(&[Bytes])>;

#[derive(Default)]
struct MockStore {
    messages: Vec<Bytes>,
    failing_connects: u32,
    reject_auth: bool,
    failing_commits: HashSet<u32>,
    lost_commit_replies: HashSet<u32>,
    fail_every_commit: bool,
    ignore_commits: bool,
    failing_fetches: u32,
    failing_marks: HashSet<u32>,
    commit_observer: Option<CommitObserver>,
    stats: MockStats,
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct MockStats {
    pub opened: u32,
    pub peeks: u32,
    pub marks: u32,
    pub commits_attempted: u32,
    pub commits_applied: u32,
    pub committed_batches: Vec<u32>,
}

/// In-memory mailbox with failure injection, shared between the test and the
/// sessions it hands out.
#[derive(Clone, Default)]
pub struct MockMailbox {
    store: Rc<RefCell<MockStore>>,
}

impl MockMailbox {
    pub fn with_dates(dates: impl IntoIterator<Item = Option<DateTime>>) -> Self {
        let messages = dates
            .into_iter()
            .enumerate()
            .map(|(index, date)| render_message(index + 1, date))
            .collect();
        let mailbox = Self::default();
        mailbox.store.borrow_mut().messages = messages;
        mailbox
    }

    pub fn daily(from: DateTime, days: usize) -> Self {
        Self::with_dates((0..days).map(|day| {
            Some(
                from.checked_add(jiff::Span::new().days(i64::try_from(day).unwrap_or(i64::MAX)))
                    .unwrap_or(from),
            )
        }))
    }

    pub fn fail_next_connects(&self, count: u32) -> &Self {
        self.store.borrow_mut().failing_connects = count;
        self
    }

    pub fn reject_auth(&self) -> &Self {
        self.store.borrow_mut().reject_auth = true;
        self
    }

    /// Commit attempts are numbered from 1 over the lifetime of the mailbox.
    pub fn fail_commit_attempts(&self, attempts: &[u32]) -> &Self {
        self.store
            .borrow_mut()
            .failing_commits
            .extend(attempts.iter().copied());
        self
    }

    /// These commit attempts are applied, but the reply never arrives.
    pub fn lose_commit_replies(&self, attempts: &[u32]) -> &Self {
        self.store
            .borrow_mut()
            .lost_commit_replies
            .extend(attempts.iter().copied());
        self
    }

    pub fn fail_every_commit(&self) -> &Self {
        self.store.borrow_mut().fail_every_commit = true;
        self
    }

    /// Commits report success but never remove anything.
    pub fn ignore_commits(&self) -> &Self {
        self.store.borrow_mut().ignore_commits = true;
        self
    }

    pub fn fail_next_fetches(&self, count: u32) -> &Self {
        self.store.borrow_mut().failing_fetches = count;
        self
    }

    pub fn fail_marks_at(&self, positions: &[u32]) -> &Self {
        self.store
            .borrow_mut()
            .failing_marks
            .extend(positions.iter().copied());
        self
    }

    /// Called with the contents about to be removed, right before a commit is
    /// applied.
    pub fn on_commit(&self, observer: impl FnMut(&[Bytes]) + 'static) -> &Self {
        self.store.borrow_mut().commit_observer = Some(Box::new(observer));
        self
    }

    pub fn len(&self) -> u32 {
        u32::try_from(self.store.borrow().messages.len()).unwrap_or(u32::MAX)
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.store.borrow().messages.clone()
    }

    pub fn dates(&self) -> Vec<Option<DateTime>> {
        self.store
            .borrow()
            .messages
            .iter()
            .map(|message| message_date(message).ok())
            .collect()
    }

    pub fn stats(&self) -> MockStats {
        self.store.borrow().stats.clone()
    }
}

pub fn render_message(index: usize, date: Option<DateTime>) -> Bytes {
    let date_header = date
        .map(|date| {
            format!(
                "Date: {}\r\n",
                date.strftime("%a, %d %b %Y %H:%M:%S +0000")
            )
        })
        .unwrap_or_default();
    Bytes::from(format!(
        "{date_header}Subject: message {index}\r\nMessage-ID: <{index}@mock.invalid>\r\n\r\nbody of message {index}\r\n"
    ))
}

impl MailboxAccess for MockMailbox {
    type Session = MockSession;

    async fn open(&self) -> Result<Self::Session, SessionError> {
        let mut store = self.store.borrow_mut();
        if store.failing_connects > 0 {
            store.failing_connects -= 1;
            return Err(SessionError::Connect("connection refused".to_string()));
        }
        if store.reject_auth {
            return Err(SessionError::Auth("invalid credentials".to_string()));
        }
        store.stats.opened += 1;

        Ok(MockSession {
            store: self.store.clone(),
            marked: BTreeSet::new(),
        })
    }
}

pub struct MockSession {
    store: Rc<RefCell<MockStore>>,
    marked: BTreeSet<u32>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("marked", &self.marked)
            .finish_non_exhaustive()
    }
}

impl MockSession {
    fn message(&self, position: SequencePosition) -> Result<Bytes, SessionError> {
        let index = usize::try_from(position.get() - 1).unwrap_or(usize::MAX);
        self.store
            .borrow()
            .messages
            .get(index)
            .cloned()
            .ok_or_else(|| SessionError::Protocol(format!("no such message {position}")))
    }
}

impl MailSession for MockSession {
    async fn count(&mut self) -> Result<u32, SessionError> {
        Ok(u32::try_from(self.store.borrow().messages.len()).unwrap_or(u32::MAX))
    }

    async fn peek_header(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        self.store.borrow_mut().stats.peeks += 1;
        let message = self.message(position)?;
        let end = message
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map_or(message.len(), |end| end + 4);
        Ok(message.slice(..end))
    }

    async fn fetch_full(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        {
            let mut store = self.store.borrow_mut();
            if store.failing_fetches > 0 {
                store.failing_fetches -= 1;
                return Err(SessionError::Protocol("-ERR message unavailable".to_string()));
            }
        }
        self.message(position)
    }

    async fn mark_deleted(&mut self, position: SequencePosition) -> Result<(), SessionError> {
        self.message(position)?;
        if self.store.borrow().failing_marks.contains(&position.get()) {
            return Err(SessionError::Protocol(format!("cannot mark {position}")));
        }
        self.marked.insert(position.get());
        self.store.borrow_mut().stats.marks += 1;
        Ok(())
    }

    async fn commit(self) -> Result<(), SessionError> {
        let mut store = self.store.borrow_mut();
        store.stats.commits_attempted += 1;
        let attempt = store.stats.commits_attempted;
        if store.fail_every_commit || store.failing_commits.contains(&attempt) {
            return Err(SessionError::Transaction("-ERR server error".to_string()));
        }
        if store.ignore_commits {
            return Ok(());
        }

        let removed: Vec<Bytes> = self
            .marked
            .iter()
            .filter_map(|position| {
                store
                    .messages
                    .get(usize::try_from(*position - 1).ok()?)
                    .cloned()
            })
            .collect();
        if let Some(observer) = store.commit_observer.as_mut() {
            observer(&removed);
        }
        for position in self.marked.iter().rev() {
            if let Ok(index) = usize::try_from(*position - 1) {
                store.messages.remove(index);
            }
        }
        store.stats.commits_applied += 1;
        let size = u32::try_from(self.marked.len()).unwrap_or(u32::MAX);
        store.stats.committed_batches.push(size);
        if store.lost_commit_replies.contains(&attempt) {
            return Err(SessionError::Transaction(
                "connection closed before the reply".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(self) {}
}
