mod evaluator;
mod job;
mod parser;
mod precision;
mod script;
mod special;

pub use evaluator::{CaseJudger, CaseSetEvaluator, SubmissionEvaluator};
pub use job::{JudgeContext, JudgementJob};
pub use parser::{ExecResultParser, ParseError};
pub use script::load_judge_script;
pub use special::Checker;

use std::time::Duration;

use crate::models::Language;
use crate::sandbox::{ExecResult, Sandbox, SandboxError, SandboxFactory, WORKSPACE};

/// Fixed envelope for every compilation, submissions and checkers alike.
pub(crate) const COMPILE_TIME_LIMIT: Duration = Duration::from_secs(5);
pub(crate) const COMPILE_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

/// Compiles source code in a fresh sandbox and returns the sandbox still
/// holding the executable, together with the compiler's result.
///
/// The sandbox outlives this call so the executable can be copied into
/// exec sandboxes later; the caller owns its destruction. On error the
/// partially set up sandbox is destroyed here.
pub(crate) async fn compile_source<F: SandboxFactory>(
    factory: &F,
    language: &Language,
    source_code: &str,
    image_prefix: &str,
) -> Result<(F::Sandbox, ExecResult), SandboxError> {
    let image = format!("{image_prefix}{}", language.image_name);
    let mut sandbox = factory
        .create(
            &image,
            COMPILE_TIME_LIMIT,
            COMPILE_MEMORY_LIMIT,
            &language.compile_command,
        )
        .await?;

    let source_path = format!("{WORKSPACE}{}", language.source_file_name);
    if let Err(e) = sandbox.inject_file(source_code.as_bytes(), &source_path).await {
        sandbox.destroy().await;
        return Err(e);
    }

    match sandbox.run(b"", true).await {
        Ok(result) => Ok((sandbox, result)),
        Err(e) => {
            sandbox.destroy().await;
            Err(e)
        }
    }
}
