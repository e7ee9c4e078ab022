mod docker;
mod runner;
#[cfg(test)]
pub(crate) mod testing;

pub use docker::{DockerFactory, DockerSandbox};
pub use runner::{Sandbox, SandboxFactory};

use std::time::Duration;

use thiserror::Error;

/// Directory inside every sandbox where source and executable files live.
pub const WORKSPACE: &str = "/workspace/";

/// Directory inside a judgement sandbox holding the numbered input files.
pub const INPUT_DIR: &str = "/tmp/input/";

/// In-sandbox path of the batch-runner script.
pub const JUDGE_SCRIPT_PATH: &str = "/tmp/judge.sh";

/// Hard cap on captured stdout. Exceeding it yields `OutputLimitExceeded`.
pub const OUTPUT_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox from image {image}: {reason}")]
    Create { image: String, reason: String },
    #[error("sandbox file transfer failed: {0}")]
    Io(String),
    #[error("sandbox run failed: {0}")]
    Run(String),
}

/// How a sandboxed command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Finished,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    OutputLimitExceeded,
    InternalError,
}

/// Outcome of a single sandbox `run`.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub exec_time: Duration,
    /// Peak memory in bytes, when the runtime reported it; zero otherwise.
    pub memory_usage: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}
