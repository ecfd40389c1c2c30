mod archive;

use std::{fmt::Display, path::PathBuf, time::Duration};

use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::{
    engine::{Backoff, EngineConfig, Outcome},
    mailbox::{
        MailSession, MailboxAccess, SequencePosition, SessionError, message_date, observe_count,
    },
};

use archive::ArchiveEntry;
pub use archive::ArchiveSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub backed_up: u32,
    /// Observed shrinkage of the mailbox, zero without deletion.
    pub deleted: u32,
    pub archives: Vec<PathBuf>,
    pub outcome: Outcome,
}

/// A commit whose effect has not been observed yet.
#[derive(Debug, Clone, Copy)]
struct PendingCommit {
    /// Message count of the session that committed.
    before: u32,
    batch: u32,
    /// Whether the server acknowledged the commit.
    acknowledged: bool,
}

enum Step {
    Continue,
    Retry(Duration),
    Finished,
    Abort(String),
}

/// Copies `total` messages starting at a fixed position into an
/// [`ArchiveSet`], one fresh session per batch, optionally deleting every
/// batch once it is safely on disk.
///
/// With deletion every batch is read at the start position, because the
/// previous batch is gone. Without it the read cursor moves forward by the
/// number of messages archived so far.
pub struct BackupPipeline<'a, A: MailboxAccess> {
    access: &'a A,
    config: &'a EngineConfig,
    archives: ArchiveSet,
    start: SequencePosition,
    total: u32,
    delete_after: bool,
    backed_up: u32,
    initial_count: Option<u32>,
    observed_count: Option<u32>,
    pending_commit: Option<PendingCommit>,
    failures: u32,
    fetch_failures: u32,
}

impl<'a, A: MailboxAccess> BackupPipeline<'a, A> {
    pub fn new(
        access: &'a A,
        config: &'a EngineConfig,
        archives: ArchiveSet,
        start: SequencePosition,
        total: u32,
        delete_after: bool,
    ) -> Self {
        Self {
            access,
            config,
            archives,
            start,
            total,
            delete_after,
            backed_up: 0,
            initial_count: None,
            observed_count: None,
            pending_commit: None,
            failures: 0,
            fetch_failures: 0,
        }
    }

    pub async fn run(mut self) -> BackupReport {
        info!(
            "backing up {} messages starting at #{}{}",
            self.total,
            self.start,
            if self.delete_after {
                ", deleting every batch after it is written"
            } else {
                ""
            }
        );

        let outcome = loop {
            if self.backed_up >= self.total {
                break Outcome::Completed;
            }
            match self.batch().await {
                Step::Continue => {
                    info!("progress: {}/{}", self.backed_up, self.total);
                    let pause = self.config.backup_pause();
                    if self.backed_up < self.total && !pause.is_zero() {
                        sleep(pause).await;
                    }
                }
                Step::Retry(wait) => {
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                }
                Step::Finished => break Outcome::Completed,
                Step::Abort(reason) => {
                    error!("giving up: {reason}");
                    break Outcome::Failed(reason);
                }
            }
        };

        if self.delete_after && self.initial_count.is_some() {
            match observe_count(self.access).await {
                Ok(count) => {
                    self.observed_count = Some(count);
                    if let Some(stall) = self.settle(count) {
                        warn!("{stall}");
                    }
                }
                Err(e) => warn!("could not observe the final count: {e}"),
            }
        }
        self.log_summary();

        BackupReport {
            backed_up: self.backed_up,
            deleted: self.deleted(),
            archives: self.archives.written_paths(),
            outcome,
        }
    }

    async fn batch(&mut self) -> Step {
        let mut session = match self.access.open().await {
            Ok(session) => session,
            Err(e) => return self.session_failure(self.config.connect_backoff(), e),
        };
        let count = match session.count().await {
            Ok(count) => count,
            Err(e) => {
                session.close().await;
                return self.session_failure(self.config.connect_backoff(), e);
            }
        };
        self.initial_count.get_or_insert(count);
        self.observed_count = Some(count);

        if let Some(stall) = self.settle(count) {
            session.close().await;
            return self.failure(self.config.commit_backoff(), stall);
        }

        let remaining = self.remaining(count);
        if remaining == 0 {
            session.close().await;
            return Step::Finished;
        }
        let cursor = if self.delete_after {
            self.start.get()
        } else {
            self.start.get().saturating_add(self.backed_up)
        };
        if cursor > count {
            info!("no more messages at #{cursor}");
            session.close().await;
            return Step::Finished;
        }
        let batch = self
            .config
            .batch_size()
            .min(remaining)
            .min(count - cursor + 1);
        info!(
            "downloading #{cursor} to #{} ({}/{} done)",
            cursor + batch - 1,
            self.backed_up,
            self.total
        );

        let mut entries = Vec::new();
        let mut session_lost = None;
        for position in cursor..cursor + batch {
            let Ok(position) = SequencePosition::try_from(position) else {
                break;
            };
            match session.fetch_full(position).await {
                Ok(content) => {
                    self.fetch_failures = 0;
                    let date = message_date(&content).ok();
                    let running = self.backed_up + u32::try_from(entries.len()).unwrap_or(u32::MAX) + 1;
                    entries.push(ArchiveEntry::new(
                        self.archives.entry_index(running),
                        date,
                        content,
                    ));
                }
                Err(e) if e.is_fatal() => {
                    session.close().await;
                    return Step::Abort(e.to_string());
                }
                Err(e) => {
                    warn!("could not fetch #{position}: {e}");
                    self.fetch_failures += 1;
                    if self.fetch_failures >= self.config.max_fetch_failures() {
                        session.close().await;
                        return Step::Abort(format!(
                            "{} fetches failed in a row, last: {e}",
                            self.fetch_failures
                        ));
                    }
                    if let SessionError::Connect(_) = e {
                        session_lost = Some(e);
                    }
                    // the message is retried first in the next batch
                    break;
                }
            }
        }

        let fetched = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        if fetched > 0 {
            match self.archives.append(&entries) {
                Ok(written) => debug!("wrote {written} of {fetched} entries"),
                Err(e) => {
                    session.close().await;
                    return Step::Abort(format!("cannot write archive: {e}"));
                }
            }
        }

        if let Some(e) = session_lost {
            if !self.delete_after {
                self.backed_up += fetched;
            }
            return self.failure(self.config.connect_backoff(), e);
        }
        if fetched == 0 {
            session.close().await;
            return Step::Retry(self.config.backup_pause());
        }

        if !self.delete_after {
            session.close().await;
            self.backed_up += fetched;
            self.failures = 0;
            return Step::Continue;
        }
        self.delete(session, cursor, fetched, count).await
    }

    async fn delete(
        &mut self,
        mut session: A::Session,
        cursor: u32,
        fetched: u32,
        count: u32,
    ) -> Step {
        debug!("marking {fetched} archived messages");
        for position in cursor..cursor + fetched {
            let Ok(position) = SequencePosition::try_from(position) else {
                break;
            };
            if let Err(e) = session.mark_deleted(position).await {
                session.close().await;
                if e.is_fatal() {
                    return Step::Abort(e.to_string());
                }
                return self.failure(
                    self.config.commit_backoff(),
                    format!("could not mark #{position}, retrying the batch: {e}"),
                );
            }
        }

        match session.commit().await {
            Ok(()) => {
                info!("deleted {fetched} archived messages");
                self.backed_up += fetched;
                self.pending_commit = Some(PendingCommit {
                    before: count,
                    batch: fetched,
                    acknowledged: true,
                });
                Step::Continue
            }
            Err(e) => {
                warn!("archived entries stay, the next count tells whether the batch is gone");
                self.pending_commit = Some(PendingCommit {
                    before: count,
                    batch: fetched,
                    acknowledged: false,
                });
                self.session_failure(self.config.commit_backoff(), e)
            }
        }
    }

    /// Resolves the pending commit against the message count of a later
    /// session. A commit took effect when the mailbox shrank by at least its
    /// batch, whatever the server replied. Returns the stall to report when an
    /// acknowledged commit had no effect.
    fn settle(&mut self, count: u32) -> Option<String> {
        let pending = self.pending_commit.take()?;
        let applied = pending.before.saturating_sub(count) >= pending.batch;
        match (applied, pending.acknowledged) {
            (true, true) => {
                self.failures = 0;
                None
            }
            (true, false) => {
                info!(
                    "the unconfirmed commit of {} messages was applied",
                    pending.batch
                );
                self.backed_up += pending.batch;
                self.failures = 0;
                None
            }
            (false, true) => {
                // the batch is still there and will be read again
                self.backed_up -= pending.batch;
                Some(format!(
                    "commit reported success but the mailbox still has {count} messages"
                ))
            }
            (false, false) => None,
        }
    }

    /// Messages still to process. With deletion this is also bounded by the
    /// observed shrinkage, so nothing past the range is ever removed.
    fn remaining(&self, count: u32) -> u32 {
        let left = self.total.saturating_sub(self.backed_up);
        match (self.delete_after, self.initial_count) {
            (true, Some(initial)) => {
                left.min(self.total.saturating_sub(initial.saturating_sub(count)))
            }
            _ => left,
        }
    }

    fn session_failure(&mut self, backoff: Backoff, error: SessionError) -> Step {
        if error.is_fatal() {
            Step::Abort(error.to_string())
        } else {
            self.failure(backoff, error)
        }
    }

    fn failure(&mut self, backoff: Backoff, error: impl Display) -> Step {
        self.failures += 1;
        if self.failures >= self.config.max_consecutive_failures() {
            return Step::Abort(format!(
                "{} consecutive failures, last: {error}",
                self.failures
            ));
        }

        let wait = backoff.wait(self.failures);
        warn!(
            "failure {} of {}: {error}; retrying in {}s",
            self.failures,
            self.config.max_consecutive_failures(),
            wait.as_secs()
        );
        Step::Retry(wait)
    }

    fn deleted(&self) -> u32 {
        match (self.delete_after, self.initial_count, self.observed_count) {
            (true, Some(initial), Some(observed)) => initial.saturating_sub(observed),
            _ => 0,
        }
    }

    fn log_summary(&self) {
        match self.archives.summary() {
            Ok(bundles) => {
                for bundle in bundles {
                    #[expect(clippy::cast_precision_loss)]
                    let megabytes = bundle.size as f64 / 1024.0 / 1024.0;
                    info!(
                        "{}: {} messages, {megabytes:.1} MB",
                        bundle.path.display(),
                        bundle.entries
                    );
                }
            }
            Err(e) => warn!("could not summarize archives: {e}"),
        }
        if self.delete_after {
            info!(
                "{} messages backed up, {} deleted",
                self.backed_up,
                self.deleted()
            );
        } else {
            info!("{} messages backed up", self.backed_up);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashSet, rc::Rc};

    use assertables::*;
    use bytes::Bytes;
    use jiff::civil::{DateTime, date};
    use rstest::*;
    use tempfile::{TempDir, tempdir};

    use super::{archive::tests::read_bundles, *};
    use crate::mailbox::mock::MockMailbox;

    fn day(n: i8) -> DateTime {
        date(2020, 1, n).at(0, 0, 0, 0)
    }

    #[fixture]
    fn output() -> TempDir {
        assert_ok!(tempdir())
    }

    async fn back_up(
        mailbox: &MockMailbox,
        output: &TempDir,
        batch_size: u32,
        start: u32,
        total: u32,
        delete_after: bool,
    ) -> BackupReport {
        let config = EngineConfig::without_waits(batch_size);
        let archives = assert_ok!(ArchiveSet::open(output.path()));
        let start = assert_ok!(SequencePosition::try_from(start));
        BackupPipeline::new(mailbox, &config, archives, start, total, delete_after)
            .run()
            .await
    }

    fn archived(output: &TempDir) -> Vec<Bytes> {
        read_bundles(output.path()).into_values().collect()
    }

    #[rstest]
    #[tokio::test]
    async fn test_backup_only_reads_forward_and_keeps_mailbox(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 10);
        let report = back_up(&mailbox, &output, 3, 2, 7, false).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(7, report.backed_up);
        assert_eq!(0, report.deleted);
        assert_eq!(10, mailbox.len());
        assert_eq!(0, mailbox.stats().marks);

        let expected: HashSet<Bytes> = mailbox.messages()[1..8].iter().cloned().collect();
        let archived: HashSet<Bytes> = archived(&output).into_iter().collect();
        assert_eq!(expected, archived);
        assert_eq!(
            vec![output.path().join("emails_2020-01.zip")],
            report.archives
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_every_deleted_message_was_archived_first(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 10);
        let dir = output.path().to_path_buf();
        let deleted = Rc::new(RefCell::new(Vec::new()));
        let seen = deleted.clone();
        mailbox.on_commit(move |removed| {
            let on_disk: HashSet<Bytes> = read_bundles(&dir).into_values().collect();
            for message in removed {
                assert_contains!(on_disk, message);
            }
            seen.borrow_mut().extend_from_slice(removed);
        });
        let originals = mailbox.messages();

        let report = back_up(&mailbox, &output, 2, 1, 5, true).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(5, report.backed_up);
        assert_eq!(5, report.deleted);
        assert_eq!(originals[..5].to_vec(), *deleted.borrow());
        assert_eq!(originals[5..].to_vec(), mailbox.messages());
        assert_eq!(vec![2, 2, 1], mailbox.stats().committed_batches);
    }

    #[rstest]
    #[tokio::test]
    async fn test_retried_batch_is_archived_once(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 6);
        mailbox.fail_commit_attempts(&[2]);
        let originals = mailbox.messages();

        let report = back_up(&mailbox, &output, 2, 1, 6, true).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(6, report.deleted);
        assert_eq!(4, mailbox.stats().commits_attempted);
        let mut archived = archived(&output);
        archived.sort();
        let mut expected = originals;
        expected.sort();
        assert_eq!(expected, archived);
    }

    #[rstest]
    #[tokio::test]
    async fn test_applied_commit_without_reply_is_not_repeated(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 6);
        mailbox.lose_commit_replies(&[1]);
        let dir = output.path().to_path_buf();
        let deleted = Rc::new(RefCell::new(Vec::new()));
        let seen = deleted.clone();
        mailbox.on_commit(move |removed| {
            let on_disk: HashSet<Bytes> = read_bundles(&dir).into_values().collect();
            for message in removed {
                assert_contains!(on_disk, message);
            }
            seen.borrow_mut().extend_from_slice(removed);
        });
        let originals = mailbox.messages();

        let report = back_up(&mailbox, &output, 2, 1, 4, true).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(4, report.backed_up);
        assert_eq!(4, report.deleted);
        assert_eq!(originals[..4].to_vec(), *deleted.borrow());
        assert_eq!(originals[4..].to_vec(), mailbox.messages());
        let archived: HashSet<Bytes> = archived(&output).into_iter().collect();
        assert_eq!(originals[..4].iter().cloned().collect::<HashSet<_>>(), archived);
    }

    #[rstest]
    #[tokio::test]
    async fn test_deletion_stays_inside_the_range_when_replies_are_lost(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.lose_commit_replies(&[1, 2, 3]);

        let report = back_up(&mailbox, &output, 2, 1, 4, true).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(4, report.deleted);
        assert_eq!(6, mailbox.len());
        assert_eq!(4, archived(&output).len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_mark_discards_the_batch(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 4);
        mailbox.fail_marks_at(&[2]);

        let report = back_up(&mailbox, &output, 2, 1, 4, true).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, report.deleted);
        assert_eq!(0, mailbox.stats().commits_attempted);
        assert_eq!(4, mailbox.len());
        assert_eq!(2, archived(&output).len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_fetch_failures_in_a_row_abort(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.fail_next_fetches(5);

        let report = back_up(&mailbox, &output, 3, 1, 10, true).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, report.backed_up);
        assert_eq!(0, mailbox.stats().commits_attempted);
    }

    #[rstest]
    #[tokio::test]
    async fn test_occasional_fetch_failure_is_retried(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 6);
        mailbox.fail_next_fetches(2);

        let report = back_up(&mailbox, &output, 3, 1, 6, false).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(6, report.backed_up);
        assert_eq!(6, archived(&output).len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_undated_messages_land_in_unknown_bundle(output: TempDir) {
        let mailbox = MockMailbox::with_dates([None, Some(day(3))]);

        let report = back_up(&mailbox, &output, 5, 1, 2, false).await;

        assert_eq!(Outcome::Completed, report.outcome);
        let names: Vec<(String, String)> = read_bundles(output.path()).into_keys().collect();
        assert_eq!(
            vec![
                (
                    "emails_1970-01.zip".to_string(),
                    "msg_000001_unknown.eml".to_string()
                ),
                (
                    "emails_2020-01.zip".to_string(),
                    "msg_000002_20200103.eml".to_string()
                ),
            ],
            names
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_commit_without_effect_is_not_counted(output: TempDir) {
        let mailbox = MockMailbox::daily(day(1), 4);
        mailbox.ignore_commits();

        let report = back_up(&mailbox, &output, 2, 1, 4, true).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, report.deleted);
        assert_eq!(2, archived(&output).len());
    }
}
