use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use super::{
    ExecResult, ExecStatus, Sandbox, SandboxError, SandboxFactory, INPUT_DIR, JUDGE_SCRIPT_PATH,
    OUTPUT_LIMIT,
};

const CONTAINER_NAME_PREFIX: &str = "koj-sandbox-";

/// Slack added to a plain sandbox's wall budget before the host kills it.
const RUN_GRACE: Duration = Duration::from_secs(2);

/// Startup and per-case bookkeeping allowance for the batch runner.
const BATCH_OVERHEAD: Duration = Duration::from_secs(5);

/// The in-sandbox `timeout` kills a case this long after the time limit,
/// so an over-limit case still reports a measured time above the limit.
const CASE_KILL_GRACE: Duration = Duration::from_secs(1);

const STDERR_LIMIT: usize = 64 * 1024;

/// Creates Docker-container-backed sandboxes.
pub struct DockerFactory;

#[async_trait]
impl SandboxFactory for DockerFactory {
    type Sandbox = DockerSandbox;

    async fn create(
        &self,
        image: &str,
        wall_limit: Duration,
        memory_limit: u64,
        cmd: &[String],
    ) -> Result<DockerSandbox, SandboxError> {
        DockerSandbox::create(image, wall_limit, memory_limit, cmd, None).await
    }

    async fn create_judgement(
        &self,
        image: &str,
        time_limit: Duration,
        memory_limit: u64,
        cmd: &[String],
        exe_file_name: &str,
    ) -> Result<DockerSandbox, SandboxError> {
        let setup = JudgementSetup {
            time_limit,
            exe_file_name: exe_file_name.to_string(),
        };
        DockerSandbox::create(image, time_limit, memory_limit, cmd, Some(setup)).await
    }
}

struct JudgementSetup {
    time_limit: Duration,
    exe_file_name: String,
}

/// A sandbox backed by one Docker container, driven through the `docker`
/// CLI the same way the rest of the judge drives external tools.
///
/// The container is created stopped, receives files via `docker cp`, runs
/// attached exactly when asked, and is removed on destroy. Memory is
/// enforced by the container limit (an OOM kill surfaces through
/// `docker inspect`); the wall clock is enforced host-side with a kill.
pub struct DockerSandbox {
    name: String,
    wall_limit: Duration,
    /// Set for judgement sandboxes; scales the wall budget per input file.
    per_case_limit: Option<Duration>,
    input_count: u32,
    started: bool,
    destroyed: bool,
}

impl DockerSandbox {
    async fn create(
        image: &str,
        wall_limit: Duration,
        memory_limit: u64,
        cmd: &[String],
        judgement: Option<JudgementSetup>,
    ) -> Result<Self, SandboxError> {
        let name = format!("{CONTAINER_NAME_PREFIX}{:016x}", rand::random::<u64>());
        let memory_arg = memory_limit.to_string();

        let mut args: Vec<String> = [
            "create",
            "-i",
            "--network",
            "none",
            "--memory",
            &memory_arg,
            "--memory-swap",
            &memory_arg,
            "-w",
            "/workspace",
            "--name",
            &name,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let per_case_limit = judgement.as_ref().map(|s| s.time_limit);
        if let Some(setup) = &judgement {
            let kill_after = (setup.time_limit + CASE_KILL_GRACE).as_secs_f64();
            args.push("-e".to_string());
            args.push(format!("CASE_TIME_LIMIT={kill_after:.3}"));
            args.push("-e".to_string());
            args.push(format!("EXE_FILE={}", setup.exe_file_name));
        }

        args.push(image.to_string());
        match judgement {
            Some(_) => {
                args.push("/bin/sh".to_string());
                args.push(JUDGE_SCRIPT_PATH.to_string());
                args.extend(cmd.iter().cloned());
            }
            None => args.extend(cmd.iter().cloned()),
        }

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| SandboxError::Create {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(SandboxError::Create {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        log::debug!("sandbox {name} created from image {image}");
        Ok(DockerSandbox {
            name,
            wall_limit,
            per_case_limit,
            input_count: 0,
            started: false,
            destroyed: false,
        })
    }

    fn wall_budget(&self) -> Duration {
        match self.per_case_limit {
            Some(per_case) => per_case * self.input_count.max(1) + BATCH_OVERHEAD,
            None => self.wall_limit + RUN_GRACE,
        }
    }

    async fn inspect_state(&self) -> Option<(i64, bool)> {
        let output = Command::new("docker")
            .args([
                "inspect",
                "-f",
                "{{.State.ExitCode}} {{.State.OOMKilled}}",
                &self.name,
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let exit_code = parts.next()?.parse().ok()?;
        let oom_killed = parts.next()? == "true";
        Some((exit_code, oom_killed))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn inject_file(&mut self, content: &[u8], path: &str) -> Result<(), SandboxError> {
        if self.started {
            return Err(SandboxError::Io(format!(
                "sandbox {} has already run, cannot inject {path}",
                self.name
            )));
        }

        // `docker cp` cannot create intermediate directories, so stage the
        // full path locally and stream it in as a tar archive rooted at /.
        let stage = tempfile::tempdir().map_err(|e| SandboxError::Io(e.to_string()))?;
        let full = stage.path().join(path.trim_start_matches('/'));
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::Io(e.to_string()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))?;

        let shell = format!(
            "tar -cf - -C '{}' . | docker cp - '{}':/",
            stage.path().display(),
            self.name
        );
        let output = Command::new("/bin/sh")
            .args(["-c", &shell])
            .output()
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::Io(format!(
                "docker cp into {} failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if path.starts_with(INPUT_DIR) {
            self.input_count += 1;
        }
        Ok(())
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let stage = tempfile::tempdir().map_err(|e| SandboxError::Io(e.to_string()))?;
        let dest = stage.path().join("out");
        let output = Command::new("docker")
            .args([
                "cp",
                &format!("{}:{path}", self.name),
                &dest.display().to_string(),
            ])
            .output()
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::Io(format!(
                "docker cp out of {} failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tokio::fs::read(&dest)
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))
    }

    async fn run(
        &mut self,
        stdin: &[u8],
        capture_stdout: bool,
    ) -> Result<ExecResult, SandboxError> {
        if self.destroyed {
            return Err(SandboxError::Run(format!(
                "sandbox {} is destroyed",
                self.name
            )));
        }
        self.started = true;

        let mut child = Command::new("docker")
            .args(["start", "-a", "-i", &self.name])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Run(e.to_string()))?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Run("no stdin pipe".to_string()))?;
        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Run("no stdout pipe".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Run("no stderr pipe".to_string()))?;

        let stdin_data = stdin.to_vec();
        let stdin_task = tokio::spawn(async move {
            let _ = child_stdin.write_all(&stdin_data).await;
            let _ = child_stdin.shutdown().await;
        });
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, OUTPUT_LIMIT));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, STDERR_LIMIT));

        let budget = self.wall_budget();
        let started_at = Instant::now();
        let timed_out = match timeout(budget, child.wait()).await {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => return Err(SandboxError::Run(format!("wait failed: {e}"))),
            Err(_) => {
                log::debug!("sandbox {} hit wall budget {budget:?}", self.name);
                let _ = Command::new("docker")
                    .args(["kill", &self.name])
                    .output()
                    .await;
                let _ = child.wait().await;
                true
            }
        };
        let exec_time = if timed_out {
            budget
        } else {
            started_at.elapsed()
        };

        let _ = stdin_task.await;
        let (mut stdout, stdout_truncated) = stdout_task.await.unwrap_or((Vec::new(), false));
        let (stderr, _) = stderr_task.await.unwrap_or((Vec::new(), false));
        if !capture_stdout {
            stdout.clear();
        }

        let state = self.inspect_state().await;
        let (exit_code, oom_killed) = state.unwrap_or((-1, false));
        let status = if oom_killed {
            ExecStatus::MemoryLimitExceeded
        } else if timed_out {
            ExecStatus::TimeLimitExceeded
        } else if stdout_truncated {
            ExecStatus::OutputLimitExceeded
        } else if state.is_none() {
            ExecStatus::InternalError
        } else if exit_code != 0 {
            ExecStatus::RuntimeError
        } else {
            ExecStatus::Finished
        };

        Ok(ExecResult {
            status,
            exec_time,
            // Container-level peak memory is not observable after exit; the
            // batch runner reports per-case figures itself.
            memory_usage: 0,
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        match Command::new("docker")
            .args(["rm", "-f", &self.name])
            .output()
            .await
        {
            Ok(out) if out.status.success() => log::debug!("sandbox {} destroyed", self.name),
            Ok(out) => log::warn!(
                "failed to remove sandbox {}: {}",
                self.name,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => log::warn!("failed to remove sandbox {}: {e}", self.name),
        }
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        // Last-resort cleanup for panicking callers.
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

async fn read_capped<R>(mut reader: R, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let take = n.min(cap.saturating_sub(buf.len()));
                buf.extend_from_slice(&chunk[..take]);
                if take < n {
                    truncated = true;
                }
            }
        }
    }
    (buf, truncated)
}
