//! Subprocess execution for one task.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::records::{RunStatus, Task};

/// Hard ceiling on one task's wall-clock run time.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

/// How long a killed subprocess is given to actually exit.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Subprocess liveness poll interval; freshly written stdout is drained
/// on the same cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A task bound to the local machine, ready to execute.
///
/// The first argument is the interpreter; the script body is fed to it
/// on stdin and the task's environment is merged over the worker's own.
/// Stdout is teed: written to an artifact file and streamed to the
/// caller in chunks. Stderr goes to an artifact file only.
pub struct LocalTask {
    task: Task,
}

impl LocalTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    /// Runs the subprocess to completion, streaming stdout chunks into
    /// `output`, and returns the terminal status.
    ///
    /// Exceeding `timeout` kills the process and reports
    /// `failed_timed_out` after a bounded grace wait. A non-python
    /// interpreter is refused before anything is spawned.
    pub async fn run(
        self,
        run_dir: PathBuf,
        artifacts_dir: PathBuf,
        timeout: Duration,
        output: mpsc::Sender<Vec<u8>>,
    ) -> std::io::Result<RunStatus> {
        let Some(interpreter) = self.task.args.first() else {
            return Ok(RunStatus::FailedNotAPythonCommand);
        };
        if !is_python_command(interpreter) {
            warn!(command = %interpreter, "Unsupported task interpreter");
            return Ok(RunStatus::FailedNotAPythonCommand);
        }

        tokio::fs::create_dir_all(&run_dir).await?;
        let stderr_file = std::fs::File::create(artifacts_dir.join("task.err"))?;
        let mut child = Command::new(interpreter)
            .args(&self.task.args[1..])
            .envs(&self.task.env)
            .current_dir(&run_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.task.script.as_bytes()).await?;
            stdin.shutdown().await.ok();
        }

        let reader = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(tee_stdout(stdout, artifacts_dir.join("task.out"), output)));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break RunStatus::from_exit_status(status);
            }
            if started.elapsed() >= timeout {
                warn!(elapsed = ?started.elapsed(), "Task timed out; killing subprocess");
                child.start_kill()?;
                if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                    warn!("Subprocess did not exit within the kill grace period");
                }
                break RunStatus::FailedTimedOut;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        if let Some(reader) = reader {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to capture task output"),
                Err(e) => warn!(error = %e, "Output capture task failed"),
            }
        }
        debug!(status = %status, "Subprocess finished");
        Ok(status)
    }
}

/// Pumps subprocess stdout into the artifact file and the output
/// channel until EOF. A closed channel only stops the streaming side;
/// the artifact file still receives everything.
async fn tee_stdout(
    mut stdout: ChildStdout,
    artifact_path: PathBuf,
    output: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(artifact_path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        let _ = output.send(buf[..n].to_vec()).await;
    }
    file.flush().await
}

fn is_python_command(command: &str) -> bool {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("python"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::collections::HashMap;

    fn task(args: &[&str], script: &str) -> LocalTask {
        LocalTask::new(Task {
            args: args.iter().map(|a| a.to_string()).collect(),
            script: script.to_owned(),
            env: HashMap::new(),
            extra: Map::new(),
        })
    }

    async fn run(task: LocalTask, timeout: Duration) -> (RunStatus, Vec<u8>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(task.run(
            dir.path().join("run"),
            dir.path().to_path_buf(),
            timeout,
            tx,
        ));
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let status = handle.await.expect("join").expect("run");
        (status, collected, dir)
    }

    #[test]
    fn test_only_python_interpreters_are_supported() {
        assert!(is_python_command("python3"));
        assert!(is_python_command("/usr/bin/python3.11"));
        assert!(is_python_command("python"));
        assert!(!is_python_command("bash"));
        assert!(!is_python_command("/bin/sh"));
    }

    #[tokio::test]
    async fn test_clean_exit_succeeds_and_stdout_is_teed() {
        let (status, output, dir) =
            run(task(&["python3", "-"], "print('message to stdout')"), DEFAULT_TASK_TIMEOUT).await;

        assert_eq!(status, RunStatus::Succeed);
        assert_eq!(String::from_utf8_lossy(&output).trim(), "message to stdout");
        let artifact = std::fs::read_to_string(dir.path().join("task.out")).expect("artifact");
        assert_eq!(artifact.trim(), "message to stdout");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let (status, _, _dir) =
            run(task(&["python3", "-"], "import sys; sys.exit(11)"), DEFAULT_TASK_TIMEOUT).await;

        assert_eq!(status, RunStatus::FailedWithCode(11));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_subprocess() {
        let started = Instant::now();
        let (status, _, _dir) = run(
            task(&["python3", "-"], "import time; time.sleep(10)"),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(status, RunStatus::FailedTimedOut);
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_unsupported_interpreter_is_refused_without_spawning() {
        let (status, output, _dir) = run(task(&["bash", "-c"], "true"), DEFAULT_TASK_TIMEOUT).await;

        assert_eq!(status, RunStatus::FailedNotAPythonCommand);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_task_env_overrides_the_process_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = HashMap::new();
        env.insert("TASK_MARKER".to_owned(), "from-task".to_owned());
        let local = LocalTask::new(Task {
            args: vec!["python3".to_owned(), "-".to_owned()],
            script: "import os; print(os.environ['TASK_MARKER'])".to_owned(),
            env,
            extra: Map::new(),
        });

        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(local.run(
            dir.path().join("run"),
            dir.path().to_path_buf(),
            DEFAULT_TASK_TIMEOUT,
            tx,
        ));
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let status = handle.await.expect("join").expect("run");

        assert_eq!(status, RunStatus::Succeed);
        assert_eq!(String::from_utf8_lossy(&collected).trim(), "from-task");
    }
}
