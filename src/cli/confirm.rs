use std::io::{self, BufRead, Write};

/// Rough size of an average message, used for disk space estimates.
const ESTIMATED_MESSAGE_SIZE: u64 = 50 * 1024;
/// Above this many messages a backup gets an extra warning.
const LARGE_BACKUP: u32 = 10_000;

/// Asks to type `DELETE` before anything is removed.
pub fn confirm_deletion(
    input: &mut impl BufRead,
    output: &mut impl Write,
    count: u32,
) -> io::Result<bool> {
    writeln!(output, "This permanently deletes {count} messages.")?;
    write!(output, "Type DELETE to continue: ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim() == "DELETE")
}

pub fn confirm_backup(
    input: &mut impl BufRead,
    output: &mut impl Write,
    count: u32,
    delete_after: bool,
) -> io::Result<bool> {
    writeln!(
        output,
        "Backing up {count} messages needs about {}.",
        estimated_size(count)
    )?;
    if count > LARGE_BACKUP {
        writeln!(
            output,
            "That is a large backup; it can take hours and is rate limited by the server."
        )?;
    }
    if delete_after {
        writeln!(output, "Every batch is deleted from the server once it is archived.")?;
    }
    write!(output, "Continue? [y/N] ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[expect(clippy::cast_precision_loss)]
pub fn estimated_size(count: u32) -> String {
    let bytes = u64::from(count) * ESTIMATED_MESSAGE_SIZE;
    let megabytes = bytes as f64 / 1024.0 / 1024.0;
    if megabytes >= 1024.0 {
        format!("{:.1} GB", megabytes / 1024.0)
    } else {
        format!("{megabytes:.1} MB")
    }
}
