//! Local-shell and dry-run `Executor` implementations (spec §4.4, §9
//! "Polymorphic executor": `remote`, `local`, `dry`).

use crate::executor::{DeleteOpts, ExecError, Executor, RunOpts, SyncOpts, UploadOpts};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use tokio::process::Command as TokioCommand;
use tracing::info;

/// Runs invocations as-is via `tokio::process::Command`, grounded on the
/// teacher's non-SSH branch of `execute_once` in `executor.rs`.
#[derive(Debug, Default)]
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(&self, invocation: &str, _opts: RunOpts) -> Result<Vec<String>, ExecError> {
        info!(invocation = %invocation, "running local command");
        let output = TokioCommand::new("sh").arg("-c").arg(invocation).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ExecError::NonZeroExit(format!(
                "{}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(stdout.lines().map(|s| s.to_string()).collect())
    }

    async fn upload(&self, local: &Path, remote: &str, opts: UploadOpts) -> Result<(), ExecError> {
        if opts.mkdir {
            if let Some(parent) = Path::new(remote).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !opts.force && tokio::fs::metadata(remote).await.is_ok() {
            return Err(ExecError::Transport(format!("{remote} already exists")));
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn sync(&self, local: &str, remote: &str, opts: SyncOpts) -> Result<Vec<String>, ExecError> {
        let mut cmd = TokioCommand::new("rsync");
        cmd.arg("-a");
        if opts.delete {
            cmd.arg("--delete");
        }
        for pattern in &opts.exclude {
            cmd.arg(format!("--exclude={pattern}"));
        }
        cmd.arg(local).arg(remote);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ExecError::NonZeroExit(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(|s| s.to_string()).collect())
    }

    async fn delete(&self, path: &str, opts: DeleteOpts) -> Result<(), ExecError> {
        if opts.recursive {
            tokio::fs::remove_dir_all(path).await.or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        } else {
            tokio::fs::remove_file(path).await.or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Records what it would have run and returns canned success (spec §5
/// "dry-run"); used when the caller passes `--dry-run`.
#[derive(Debug, Default)]
pub struct DryExecutor {
    pub log: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for DryExecutor {
    async fn run(&self, invocation: &str, _opts: RunOpts) -> Result<Vec<String>, ExecError> {
        info!(invocation = %invocation, "dry-run: would execute");
        self.log.lock().unwrap().push(format!("run: {invocation}"));
        Ok(vec![])
    }

    async fn upload(&self, local: &Path, remote: &str, _opts: UploadOpts) -> Result<(), ExecError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("upload: {} -> {remote}", local.display()));
        Ok(())
    }

    async fn sync(&self, local: &str, remote: &str, _opts: SyncOpts) -> Result<Vec<String>, ExecError> {
        self.log.lock().unwrap().push(format!("sync: {local} -> {remote}"));
        Ok(vec![])
    }

    async fn delete(&self, path: &str, _opts: DeleteOpts) -> Result<(), ExecError> {
        self.log.lock().unwrap().push(format!("delete: {path}"));
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_executor_captures_stdout() {
        let exec = LocalExecutor;
        let lines = exec.run("echo hello", RunOpts::default()).await.unwrap();
        assert_eq!(lines, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn local_executor_reports_non_zero_exit() {
        let exec = LocalExecutor;
        let err = exec.run("exit 3", RunOpts::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit(_)));
    }

    #[tokio::test]
    async fn dry_executor_never_touches_disk() {
        let exec = DryExecutor::default();
        exec.run("rm -rf /", RunOpts::default()).await.unwrap();
        assert_eq!(exec.log.lock().unwrap().len(), 1);
    }
}
