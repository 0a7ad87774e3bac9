//! Interface setup commands run around device acquisition.

use crate::error::{TunatError, TunatResult};
use tokio::process::Command;

/// Run `commands` in order, stopping at the first failure.
///
/// Each command is split on whitespace; the first word is the program.
/// There is no shell, so quoting and redirection are not interpreted.
pub async fn run_commands(commands: &[String]) -> TunatResult<()> {
    for command in commands {
        run_command(command).await?;
    }
    Ok(())
}

async fn run_command(command: &str) -> TunatResult<()> {
    let failed = |output: String| TunatError::Command {
        command: command.to_string(),
        output,
    };

    let mut words = command.split_whitespace();
    let program = words.next().ok_or_else(|| failed("empty command".into()))?;

    log::info!("Running: {}", command);
    let output = Command::new(program)
        .args(words)
        .output()
        .await
        .map_err(|e| failed(e.to_string()))?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();
        return Err(failed(if combined.is_empty() {
            output.status.to_string()
        } else {
            combined.to_string()
        }));
    }

    Ok(())
}
