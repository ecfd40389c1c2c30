mod confirm;

use std::io::{self, Write};

use anyhow::{Context as _, Result, bail};
use jiff::{Zoned, civil::DateTime};
use log::info;

use crate::{
    Args,
    config::{Config, Provider},
    engine::{EngineConfig, Outcome},
    imap::ImapAccess,
    mailbox::MailboxAccess,
    pop3::Pop3Access,
    resolver::{Survey, Target, survey},
    run::{RunMode, RunReport, run},
};

pub fn sweep(args: &Args, config: &Config) -> Result<()> {
    let target = config.cleanup().target(Zoned::now().datetime())?;
    let engine_config = config.engine().engine_config()?;
    let mode = args.mode();
    let account = config.account();
    let secret = account.auth().secret()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("cannot start the async runtime")?;

    let report = match account.provider() {
        Provider::Pop3 => {
            let access = Pop3Access::new(
                account.host().clone(),
                account.port(),
                account.auth().user().to_string(),
                secret,
                account.timeout(),
            );
            rt.block_on(sweep_mailbox(&access, &target, &engine_config, mode, args.unhinged))?
        }
        Provider::Imap => {
            let access = ImapAccess::new(
                account.host().clone(),
                account.port(),
                account.auth().user().to_string(),
                secret,
                account.mailbox().clone(),
                account.timeout(),
            );
            rt.block_on(sweep_mailbox(&access, &target, &engine_config, mode, args.unhinged))?
        }
    };

    let Some(report) = report else {
        return Ok(());
    };
    print_report(&mut io::stdout().lock(), &report)?;
    if let Outcome::Failed(reason) = report.outcome {
        bail!("run failed: {reason}");
    }
    Ok(())
}

async fn sweep_mailbox<A: MailboxAccess>(
    access: &A,
    target: &Target,
    config: &EngineConfig,
    mode: RunMode,
    unhinged: bool,
) -> Result<Option<RunReport>> {
    info!("surveying mailbox for messages {target}");
    let survey = survey(access, target)
        .await
        .context("cannot survey the mailbox")?;
    print_survey(&mut io::stdout().lock(), target, &survey)?;

    let count = survey.range.len();
    if count == 0 || mode == RunMode::PreviewOnly {
        return Ok(None);
    }

    if !unhinged {
        let confirmed = {
            let mut input = io::stdin().lock();
            let mut output = io::stdout().lock();
            match &mode {
                RunMode::DeleteOnly => confirm::confirm_deletion(&mut input, &mut output, count)?,
                RunMode::BackupOnly(_) => {
                    confirm::confirm_backup(&mut input, &mut output, count, false)?
                }
                RunMode::BackupThenDelete(_) => {
                    confirm::confirm_backup(&mut input, &mut output, count, true)?
                        && confirm::confirm_deletion(&mut input, &mut output, count)?
                }
                RunMode::PreviewOnly => false,
            }
        };
        if !confirmed {
            println!("Cancelled.");
            return Ok(None);
        }
    }

    let report = run(access, survey.range, config, mode).await?;
    Ok(Some(report))
}

fn describe(date: Option<DateTime>) -> String {
    date.map_or_else(|| "unknown".to_string(), |date| date.date().to_string())
}

fn print_survey(output: &mut impl Write, target: &Target, survey: &Survey) -> io::Result<()> {
    writeln!(output, "Messages in mailbox: {}", survey.count)?;
    if survey.count == 0 {
        return Ok(());
    }
    writeln!(output, "Oldest: {}", describe(survey.oldest))?;
    writeln!(output, "Newest: {}", describe(survey.newest))?;

    let range = survey.range;
    if range.is_empty() {
        writeln!(output, "No messages {target}.")?;
        return Ok(());
    }
    writeln!(
        output,
        "To remove: {} messages {target} (#{} to #{})",
        range.len(),
        range.start(),
        range.end()
    )?;
    if range.start() > 1 {
        writeln!(output, "Keep: #1 to #{}", range.start() - 1)?;
    }
    if range.end() < survey.count {
        writeln!(output, "Keep: #{} to #{}", range.end() + 1, survey.count)?;
    }
    Ok(())
}

fn print_report(output: &mut impl Write, report: &RunReport) -> io::Result<()> {
    writeln!(output, "Processed: {}", report.items_processed)?;
    writeln!(output, "Deleted: {}", report.items_deleted)?;
    for archive in &report.archives_written {
        writeln!(output, "Archive: {}", archive.display())?;
    }
    Ok(())
}
