//! Host script execution
//!
//! An item folder holds up to three stage scripts, run in order:
//! `pre-config`, `install`, `post-install`. Each is optional, but at least
//! one must exist. The first stage that exits unsuccessfully fails the item.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use bs_core::config::{InstallConfig, Platform};
use bs_core::error::InstallError;

/// Stage script names, in execution order
pub const STAGES: [&str; 3] = ["pre-config", "install", "post-install"];

/// Runs an item's stage scripts
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, folder: &Path, platform: Platform) -> Result<(), InstallError>;
}

/// Whether `folder` holds at least one file with the platform script extension
pub fn has_runnable_scripts(folder: &Path, platform: Platform) -> bool {
    let ext = platform.script_extension();
    let Ok(entries) = std::fs::read_dir(folder) else {
        return false;
    };
    entries.filter_map(Result::ok).any(|entry| {
        entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .ends_with(ext)
    })
}

/// Runs stage scripts through PowerShell or a Unix shell
#[derive(Debug, Clone)]
pub struct ShellScriptRunner {
    config: InstallConfig,
}

impl ShellScriptRunner {
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }

    fn command(&self, script: &Path, platform: Platform) -> Command {
        match platform {
            Platform::Win32Amd64 => {
                let mut cmd = Command::new(&self.config.windows_shell);
                cmd.args(["-ExecutionPolicy", "Bypass", "-NoProfile", "-File"])
                    .arg(script);
                cmd
            }
            Platform::UbuntuAmd64 => {
                let mut cmd = Command::new(&self.config.unix_shell);
                cmd.arg(script);
                cmd
            }
        }
    }

    async fn run_stage(
        &self,
        stage: &str,
        script: &Path,
        folder: &Path,
        platform: Platform,
    ) -> Result<(), InstallError> {
        tracing::info!("Running {} script {:?}", stage, script);

        let output = self
            .command(script, platform)
            .current_dir(folder)
            .stdin(Stdio::null())
            .output()
            .await?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!("[{}] {}", stage, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::warn!("[{}] {}", stage, line);
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(InstallError::ScriptExecutionFailed {
                script: stage.to_string(),
                code: output.status.code(),
            })
        }
    }
}

impl Default for ShellScriptRunner {
    fn default() -> Self {
        Self::new(InstallConfig::default())
    }
}

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
    async fn run(&self, folder: &Path, platform: Platform) -> Result<(), InstallError> {
        if !folder.is_dir() {
            return Err(InstallError::DirectoryNotFound(folder.to_path_buf()));
        }

        let mut ran = 0;
        for stage in STAGES {
            let script: PathBuf = folder.join(format!("{}{}", stage, platform.script_extension()));
            if !script.is_file() {
                tracing::debug!("No {} script in {:?}", stage, folder);
                continue;
            }
            self.run_stage(stage, &script, folder, platform).await?;
            ran += 1;
        }

        if ran == 0 {
            return Err(InstallError::ScriptMissing(folder.to_path_buf()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_runnable_scripts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_runnable_scripts(dir.path(), Platform::UbuntuAmd64));
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();
        assert!(!has_runnable_scripts(dir.path(), Platform::UbuntuAmd64));
        std::fs::write(dir.path().join("Install.SH"), "true").unwrap();
        assert!(has_runnable_scripts(dir.path(), Platform::UbuntuAmd64));
        assert!(!has_runnable_scripts(dir.path(), Platform::Win32Amd64));
        assert!(!has_runnable_scripts(
            &dir.path().join("missing"),
            Platform::UbuntuAmd64
        ));
    }

    #[cfg(unix)]
    fn sh_runner() -> ShellScriptRunner {
        ShellScriptRunner::new(InstallConfig {
            unix_shell: "/bin/sh".to_string(),
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stages_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("post-install.sh"), "echo post >> order.txt\n").unwrap();
        std::fs::write(dir.path().join("install.sh"), "echo install >> order.txt\n").unwrap();
        std::fs::write(dir.path().join("pre-config.sh"), "echo pre >> order.txt\n").unwrap();

        sh_runner()
            .run(dir.path(), Platform::UbuntuAmd64)
            .await
            .unwrap();

        let order = std::fs::read_to_string(dir.path().join("order.txt")).unwrap();
        assert_eq!(order, "pre\ninstall\npost\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_stage_stops_sequence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("install.sh"), "exit 3\n").unwrap();
        std::fs::write(dir.path().join("post-install.sh"), "touch ran\n").unwrap();

        let err = sh_runner()
            .run(dir.path(), Platform::UbuntuAmd64)
            .await
            .unwrap_err();
        match err {
            InstallError::ScriptExecutionFailed { script, code } => {
                assert_eq!(script, "install");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_missing_folder_and_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellScriptRunner::default();

        let err = runner
            .run(&dir.path().join("gone"), Platform::UbuntuAmd64)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::DirectoryNotFound(_)));

        let err = runner
            .run(dir.path(), Platform::UbuntuAmd64)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::ScriptMissing(_)));
    }
}
