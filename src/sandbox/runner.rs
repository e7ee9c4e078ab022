use std::time::Duration;

use async_trait::async_trait;

use super::{ExecResult, SandboxError};

/// An isolated execution environment with enforced wall-clock and memory
/// caps.
///
/// A sandbox is created from an image with a fixed command, receives files
/// while it has not yet run, executes the command when asked, and must be
/// destroyed exactly once. `destroy` is idempotent and callable from any
/// state; implementations additionally release their resources on drop as
/// a last resort for panicking callers.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Places a blob at an absolute path inside the sandbox.
    ///
    /// Fails once the sandbox has been run.
    async fn inject_file(&mut self, content: &[u8], path: &str) -> Result<(), SandboxError>;

    /// Reads a file out of the sandbox.
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Copies `path` from this sandbox into `dest` at the same path.
    ///
    /// Used to carry the compiled executable from the compile sandbox into
    /// an exec sandbox.
    async fn copy_file_to(&self, path: &str, dest: &mut Self) -> Result<(), SandboxError>
    where
        Self: Sized,
    {
        let content = self.fetch_file(path).await?;
        dest.inject_file(&content, path).await
    }

    /// Executes the sandbox command, capturing stderr always and stdout iff
    /// `capture_stdout`. Returns when the command exits or a limit is hit.
    async fn run(&mut self, stdin: &[u8], capture_stdout: bool)
        -> Result<ExecResult, SandboxError>;

    /// Releases all resources held by the sandbox.
    async fn destroy(&mut self);
}

/// Creates sandboxes from named images.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    type Sandbox: Sandbox;

    /// Allocates a sandbox that will execute `cmd` under `wall_limit` and
    /// `memory_limit` (bytes) when run.
    async fn create(
        &self,
        image: &str,
        wall_limit: Duration,
        memory_limit: u64,
        cmd: &[String],
    ) -> Result<Self::Sandbox, SandboxError>;

    /// Allocates a sandbox wired up for the batch runner: the command
    /// becomes the batch-runner script invoking `cmd` once per input file,
    /// with `time_limit` enforced per case and the wall budget scaled by
    /// the number of injected inputs.
    async fn create_judgement(
        &self,
        image: &str,
        time_limit: Duration,
        memory_limit: u64,
        cmd: &[String],
        exe_file_name: &str,
    ) -> Result<Self::Sandbox, SandboxError>;
}
