use std::path::PathBuf;

use log::info;

use crate::{
    backup::{ArchiveSet, BackupPipeline},
    engine::{BatchDeleteEngine, EngineConfig, Outcome},
    mailbox::MailboxAccess,
    resolver::DeletionRange,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    PreviewOnly,
    DeleteOnly,
    BackupOnly(PathBuf),
    BackupThenDelete(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub items_processed: u32,
    /// Observed shrinkage of the mailbox.
    pub items_deleted: u32,
    pub archives_written: Vec<PathBuf>,
    pub outcome: Outcome,
}

impl RunReport {
    fn nothing() -> Self {
        Self {
            items_processed: 0,
            items_deleted: 0,
            archives_written: Vec::new(),
            outcome: Outcome::Completed,
        }
    }
}

/// Acts on `range` as `mode` says. An empty range or a preview never opens a
/// session.
pub async fn run<A: MailboxAccess>(
    access: &A,
    range: DeletionRange,
    config: &EngineConfig,
    mode: RunMode,
) -> Result<RunReport, anyhow::Error> {
    let Some(start) = range.start_position() else {
        info!("nothing to do");
        return Ok(RunReport::nothing());
    };

    let (dir, delete_after) = match mode {
        RunMode::PreviewOnly => {
            info!("preview only, {} messages would be affected", range.len());
            return Ok(RunReport::nothing());
        }
        RunMode::DeleteOnly => {
            info!("deleting messages {range}");
            let report = BatchDeleteEngine::new(access, config, start, range.len())
                .run()
                .await;
            return Ok(RunReport {
                items_processed: report.deleted,
                items_deleted: report.deleted,
                archives_written: Vec::new(),
                outcome: report.outcome,
            });
        }
        RunMode::BackupOnly(dir) => (dir, false),
        RunMode::BackupThenDelete(dir) => (dir, true),
    };

    let archives = ArchiveSet::open(&dir)?;
    let report = BackupPipeline::new(access, config, archives, start, range.len(), delete_after)
        .run()
        .await;
    Ok(RunReport {
        items_processed: report.backed_up,
        items_deleted: report.deleted,
        archives_written: report.archives,
        outcome: report.outcome,
    })
}
