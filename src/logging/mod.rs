use std::{io::Write as _, os::fd::AsFd as _, time::SystemTime};

use anstyle::{AnsiColor, Effects};
use env_logger::Env;
use log::Level;

/// Installs the global logger. `RUST_LOG` overrides the `info` default.
pub fn init() {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if connected_to_journal() {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "<{}>{}: {}",
                journal_priority(record.level()),
                record.target(),
                record.args()
            )
        });
    } else {
        let subtle = AnsiColor::BrightBlack.on_default();
        builder.format(move |buf, record| {
            write!(buf, "{subtle}[{subtle:#}")?;
            match jiff::Timestamp::try_from(SystemTime::now()) {
                Ok(now) => write!(buf, "{now:.3} ")?,
                Err(_) => write!(buf, "timestamp_error ")?,
            }
            let level_style = match record.level() {
                Level::Error => AnsiColor::Red.on_default().effects(Effects::BOLD),
                Level::Warn => AnsiColor::Yellow.on_default(),
                Level::Info => AnsiColor::Green.on_default(),
                Level::Debug => AnsiColor::Blue.on_default(),
                Level::Trace => AnsiColor::Cyan.on_default(),
            };
            write!(
                buf,
                "{level_style}{}{level_style:#} {}",
                record.level(),
                record.target()
            )?;
            write!(buf, "{subtle}]{subtle:#} ")?;
            writeln!(buf, "{}", record.args())
        });
    }
    builder.init();
}

fn journal_priority(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    }
}

// systemd sets $JOURNAL_STREAM to "<device>:<inode>" of the stream it hands
// to the service, see systemd.exec(5)
fn connected_to_journal() -> bool {
    let Some(journal_stream) = std::env::var_os("JOURNAL_STREAM") else {
        return false;
    };
    rustix::fs::fstat(std::io::stderr().as_fd())
        .is_ok_and(|stat| journal_stream.to_string_lossy() == format!("{}:{}", stat.st_dev, stat.st_ino))
}
