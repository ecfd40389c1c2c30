mod backoff;
mod config;

use std::{fmt::Display, time::Duration};

use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::mailbox::{MailSession, MailboxAccess, SequencePosition, SessionError, observe_count};

pub use backoff::Backoff;
pub use config::EngineConfig;
pub use config::EngineConfigBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub initial_count: u32,
    /// Observed shrinkage of the mailbox, never a tally of commits.
    pub deleted: u32,
    pub batches: u32,
    pub outcome: Outcome,
}

enum State<S> {
    Connecting,
    Counting(S),
    Marking { session: S, count: u32, batch: u32 },
    Committing { session: S, count: u32, marked: u32 },
    Backoff(Duration),
    Done,
    Failed(String),
}

/// Deletes `target` messages starting at a fixed position, one fresh session
/// per batch.
///
/// Deleting always at the same position makes the shrinking mailbox bring the
/// next unprocessed message to that position, so the start never has to be
/// recomputed. Progress is the difference between the first and the latest
/// observed count.
pub struct BatchDeleteEngine<'a, A: MailboxAccess> {
    access: &'a A,
    config: &'a EngineConfig,
    start: SequencePosition,
    target: u32,
    initial_count: Option<u32>,
    observed_count: Option<u32>,
    unconfirmed_commit: Option<u32>,
    failures: u32,
    batches: u32,
}

impl<'a, A: MailboxAccess> BatchDeleteEngine<'a, A> {
    pub fn new(
        access: &'a A,
        config: &'a EngineConfig,
        start: SequencePosition,
        target: u32,
    ) -> Self {
        Self {
            access,
            config,
            start,
            target,
            initial_count: None,
            observed_count: None,
            unconfirmed_commit: None,
            failures: 0,
            batches: 0,
        }
    }

    pub async fn run(mut self) -> DeleteReport {
        info!(
            "deleting {} messages starting at #{} in batches of {}",
            self.target,
            self.start,
            self.config.batch_size()
        );

        let mut state = State::Connecting;
        loop {
            state = match state {
                State::Connecting => self.connect().await,
                State::Counting(session) => self.count(session).await,
                State::Marking {
                    session,
                    count,
                    batch,
                } => self.mark(session, count, batch).await,
                State::Committing {
                    session,
                    count,
                    marked,
                } => self.commit(session, count, marked).await,
                State::Backoff(wait) => {
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                    State::Connecting
                }
                State::Done => {
                    info!("deleted {} of {} messages", self.deleted(), self.target);
                    return self.report(Outcome::Completed);
                }
                State::Failed(reason) => {
                    error!("giving up: {reason}");
                    self.observe_final_count().await;
                    error!(
                        "deleted {} of {} messages before failing",
                        self.deleted(),
                        self.target
                    );
                    return self.report(Outcome::Failed(reason));
                }
            };
        }
    }

    async fn connect(&mut self) -> State<A::Session> {
        match self.access.open().await {
            Ok(session) => State::Counting(session),
            Err(e) => self.session_failure(self.config.connect_backoff(), e),
        }
    }

    async fn count(&mut self, mut session: A::Session) -> State<A::Session> {
        let count = match session.count().await {
            Ok(count) => count,
            Err(e) => {
                session.close().await;
                return self.session_failure(self.config.connect_backoff(), e);
            }
        };
        let initial = *self.initial_count.get_or_insert(count);
        self.observed_count = Some(count);

        if let Some(before) = self.unconfirmed_commit.take() {
            if count < before {
                self.failures = 0;
            } else {
                session.close().await;
                return self.failure(
                    self.config.commit_backoff(),
                    format!("commit reported success but the mailbox still has {count} messages"),
                );
            }
        }

        let deleted = initial.saturating_sub(count);
        if deleted >= self.target || count == 0 {
            session.close().await;
            return State::Done;
        }

        let available = count.saturating_sub(self.start.get() - 1);
        if available == 0 {
            warn!(
                "mailbox has only {count} messages left, nothing at #{}",
                self.start
            );
            session.close().await;
            return State::Done;
        }

        let batch = self
            .config
            .batch_size()
            .min(self.target - deleted)
            .min(available);
        debug!("{count} messages, {deleted} deleted so far, next batch {batch}");
        State::Marking {
            session,
            count,
            batch,
        }
    }

    async fn mark(&mut self, mut session: A::Session, count: u32, batch: u32) -> State<A::Session> {
        let mut marked = 0;
        let mut errors = 0;
        for offset in 0..batch {
            let Some(position) = self.start.offset(i64::from(offset), count) else {
                break;
            };
            match session.mark_deleted(position).await {
                Ok(()) => marked += 1,
                Err(e) if e.is_fatal() => {
                    session.close().await;
                    return State::Failed(e.to_string());
                }
                Err(e @ SessionError::Connect(_)) => {
                    return self.failure(self.config.connect_backoff(), e);
                }
                Err(e) => {
                    warn!("could not mark #{position}: {e}");
                    errors += 1;
                    if errors > self.config.max_mark_errors() {
                        warn!("too many mark errors, committing what was marked");
                        break;
                    }
                }
            }
        }

        if marked == 0 {
            session.close().await;
            return self.failure(
                self.config.connect_backoff(),
                "no message in the batch could be marked",
            );
        }
        State::Committing {
            session,
            count,
            marked,
        }
    }

    async fn commit(&mut self, session: A::Session, count: u32, marked: u32) -> State<A::Session> {
        debug!("committing {marked} marked messages");
        match session.commit().await {
            Ok(()) => {
                self.batches += 1;
                self.unconfirmed_commit = Some(count);
                info!(
                    "batch {}: committed {marked}, {} of {} deleted before it",
                    self.batches,
                    self.deleted(),
                    self.target
                );
                let pause = self.config.delete_pause();
                if !pause.is_zero() {
                    sleep(pause).await;
                }
                State::Connecting
            }
            Err(e) => self.session_failure(self.config.commit_backoff(), e),
        }
    }

    fn session_failure(&mut self, backoff: Backoff, error: SessionError) -> State<A::Session> {
        if error.is_fatal() {
            State::Failed(error.to_string())
        } else {
            self.failure(backoff, error)
        }
    }

    fn failure(&mut self, backoff: Backoff, error: impl Display) -> State<A::Session> {
        self.failures += 1;
        if self.failures >= self.config.max_consecutive_failures() {
            return State::Failed(format!(
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
        State::Backoff(wait)
    }

    // a commit may have gone through right before the connection dropped
    async fn observe_final_count(&mut self) {
        if self.initial_count.is_none() {
            return;
        }
        match observe_count(self.access).await {
            Ok(count) => self.observed_count = Some(count),
            Err(e) => warn!("could not observe the final count: {e}"),
        }
    }

    fn deleted(&self) -> u32 {
        match (self.initial_count, self.observed_count) {
            (Some(initial), Some(observed)) => initial.saturating_sub(observed),
            _ => 0,
        }
    }

    fn report(&self, outcome: Outcome) -> DeleteReport {
        DeleteReport {
            initial_count: self.initial_count.unwrap_or_default(),
            deleted: self.deleted(),
            batches: self.batches,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use assertables::*;
    use jiff::{
        Span,
        civil::{DateTime, date},
    };
    use rstest::*;

    use super::*;
    use crate::{
        mailbox::mock::MockMailbox,
        resolver::{Target, survey},
    };

    fn day(n: i8) -> DateTime {
        date(2020, 1, n).at(0, 0, 0, 0)
    }

    async fn delete(
        mailbox: &MockMailbox,
        config: &EngineConfig,
        start: u32,
        target: u32,
    ) -> DeleteReport {
        let start = assert_ok!(SequencePosition::try_from(start));
        BatchDeleteEngine::new(mailbox, config, start, target)
            .run()
            .await
    }

    #[rstest]
    #[tokio::test]
    async fn test_zero_target_marks_and_commits_nothing() {
        let mailbox = MockMailbox::daily(day(1), 10);
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 0).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(0, report.deleted);
        assert_eq!(0, mailbox.stats().marks);
        assert_eq!(0, mailbox.stats().commits_attempted);
        assert_eq!(10, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_deletes_leading_range_in_batches() {
        let mailbox = MockMailbox::daily(day(1), 10);
        let report = delete(&mailbox, &EngineConfig::without_waits(3), 1, 4).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(10, report.initial_count);
        assert_eq!(4, report.deleted);
        assert_eq!(vec![3, 1], mailbox.stats().committed_batches);
        let kept: Vec<_> = (5..=10).map(|n| Some(day(n))).collect();
        assert_eq!(kept, mailbox.dates());
    }

    #[rstest]
    #[tokio::test]
    async fn test_deletes_middle_range_from_fixed_start() {
        let mailbox = MockMailbox::daily(day(1), 10);
        let report = delete(&mailbox, &EngineConfig::without_waits(2), 4, 5).await;

        assert_eq!(5, report.deleted);
        let kept: Vec<_> = [1, 2, 3, 9, 10].into_iter().map(|n| Some(day(n))).collect();
        assert_eq!(kept, mailbox.dates());
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_commit_is_retried_and_not_counted() {
        let mailbox = MockMailbox::daily(day(1), 20);
        mailbox.fail_commit_attempts(&[2]);
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 20).await;

        let stats = mailbox.stats();
        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(5, stats.commits_attempted);
        assert_eq!(vec![5, 5, 5, 5], stats.committed_batches);
        assert_eq!(stats.committed_batches.iter().sum::<u32>(), report.deleted);
        assert_eq!(0, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_applied_commit_without_reply_counts_as_deleted() {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.lose_commit_replies(&[1]);
        let report = delete(&mailbox, &EngineConfig::without_waits(3), 1, 4).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(4, report.deleted);
        assert_eq!(vec![3, 1], mailbox.stats().committed_batches);
        assert_eq!(6, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_failure_ceiling_reports_partial_progress() {
        let mailbox = MockMailbox::daily(day(1), 20);
        mailbox.fail_commit_attempts(&[2, 3, 4, 5, 6]);
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 20).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(5, report.deleted);
        assert_eq!(1, report.batches);
        assert_eq!(15, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_rejected_credentials_abort_immediately() {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.reject_auth();
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 10).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, report.deleted);
        assert_eq!(0, mailbox.stats().opened);
    }

    #[rstest]
    #[case(3, true, 10)]
    #[case(10, false, 0)]
    #[tokio::test]
    async fn test_connection_failures_back_off(
        #[case] failing: u32,
        #[case] completes: bool,
        #[case] deleted: u32,
    ) {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.fail_next_connects(failing);
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 10).await;

        assert_eq!(completes, report.outcome == Outcome::Completed);
        assert_eq!(deleted, report.deleted);
    }

    #[rstest]
    #[tokio::test]
    async fn test_commits_without_effect_trip_the_ceiling() {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.ignore_commits();
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 10).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, report.deleted);
        assert_eq!(10, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_unmarkable_batch_is_never_committed() {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.fail_marks_at(&[1]);
        let report = delete(&mailbox, &EngineConfig::without_waits(5), 1, 1).await;

        assert_matches!(report.outcome, Outcome::Failed(_));
        assert_eq!(0, mailbox.stats().commits_attempted);
        assert_eq!(10, mailbox.len());
    }

    #[rstest]
    #[tokio::test]
    async fn test_mark_errors_skip_the_position() {
        let mailbox = MockMailbox::daily(day(1), 10);
        mailbox.fail_marks_at(&[2]);
        let report = delete(&mailbox, &EngineConfig::without_waits(3), 1, 3).await;

        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(3, report.deleted);
        assert_eq!(vec![2, 1], mailbox.stats().committed_batches);
    }

    #[rstest]
    #[tokio::test]
    async fn test_deleting_two_years_leaves_exactly_the_rest() {
        let first = date(2015, 1, 1).at(0, 0, 0, 0);
        let mailbox = MockMailbox::with_dates(
            (0..1000).map(|i: i64| first.checked_add(Span::new().hours(i * 52)).ok()),
        );
        let expected: Vec<_> = mailbox
            .dates()
            .into_iter()
            .filter(|date| date.is_some_and(|date| !(2016..=2017).contains(&date.year())))
            .collect();

        let target = Target::Years {
            first: 2016,
            last: 2017,
        };
        let survey = assert_ok!(survey(&mailbox, &target).await);
        let range = survey.range;
        let start = assert_some!(range.start_position());
        let report = BatchDeleteEngine::new(
            &mailbox,
            &EngineConfig::without_waits(50),
            start,
            range.len(),
        )
        .run()
        .await;

        let kept = assert_ok!(u32::try_from(expected.len()));
        assert_eq!(Outcome::Completed, report.outcome);
        assert_eq!(1000 - kept, report.deleted);
        assert_eq!(kept, mailbox.len());
        assert_eq!(expected, mailbox.dates());
    }
}
