//! Maintainer script execution

use std::path::Path;
use std::process::Command;

use crate::error::Result;

/// Captured result of a script run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    /// Combined stdout and stderr lines
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an executable with an environment in a working directory
pub trait ScriptRunner {
    fn run(&self, script: &Path, env: &[(String, String)], cwd: &Path) -> Result<ScriptOutput>;
}

/// Runs scripts as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ScriptRunner for ProcessRunner {
    fn run(&self, script: &Path, env: &[(String, String)], cwd: &Path) -> Result<ScriptOutput> {
        make_executable(script)?;

        tracing::info!("Running {}", script.display());
        let output = Command::new(script)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(|l| l.to_string()),
        );

        for line in &lines {
            tracing::debug!("{}: {}", script.display(), line);
        }

        // Killed by a signal
        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ScriptOutput { lines, exit_code })
    }
}

#[cfg(unix)]
fn make_executable(script: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(script)?.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(script, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_script: &Path) -> Result<()> {
    Ok(())
}
