use log::{info, warn};
use tokio::process::Command;

use crate::ProcessError;

/// Captured result of the system kill command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl KillOutput {
    /// `pkill` exits with 1 when no process matched; that is not a failure
    /// for recovery purposes.
    pub fn matched_nothing(&self) -> bool {
        !self.success && self.code == Some(1)
    }
}

/// Kills every process on the system whose command line contains
/// `process_class`. Best effort; the command's own output is returned.
pub async fn kill_all_matching(process_class: &str) -> Result<KillOutput, ProcessError> {
    if process_class.trim().is_empty() {
        return Err(ProcessError::EmptyProcessClass);
    }

    let output = kill_command(process_class)
        .output()
        .await
        .map_err(ProcessError::KillFailed)?;

    let result = KillOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if result.success {
        info!("Killed processes matching '{}'", process_class);
    } else if result.matched_nothing() {
        info!("No processes matched '{}'", process_class);
    } else {
        warn!(
            "Kill command for '{}' exited with {:?}: {}",
            process_class,
            result.code,
            result.stderr.trim()
        );
    }
    Ok(result)
}

#[cfg(unix)]
fn kill_command(process_class: &str) -> Command {
    let mut command = Command::new("pkill");
    command.arg("-KILL").arg("-f").arg(process_class);
    command
}

#[cfg(windows)]
fn kill_command(process_class: &str) -> Command {
    let mut command = Command::new("taskkill");
    command.args(["/F", "/T", "/IM", process_class]);
    command
}
