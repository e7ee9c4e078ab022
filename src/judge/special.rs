use std::time::Duration;

use anyhow::bail;

use crate::models::{JudgementStatus, Language};
use crate::sandbox::{ExecStatus, Sandbox, SandboxFactory, WORKSPACE};

use super::compile_source;

const CHECKER_TIME_LIMIT: Duration = Duration::from_secs(5);
const CHECKER_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

/// A compiled special-judge checker, shared across one submission.
///
/// The checker source is compiled at construction in its own sandbox,
/// under the same envelope as submissions; the executable then lives in a
/// single exec sandbox that is run once per test case and destroyed by
/// `remove`.
pub struct Checker<S: Sandbox> {
    sandbox: S,
}

impl<S: Sandbox> Checker<S> {
    pub async fn build<F>(
        factory: &F,
        source: &str,
        language: &Language,
        image_prefix: &str,
    ) -> anyhow::Result<Self>
    where
        F: SandboxFactory<Sandbox = S>,
    {
        let (mut compile_sandbox, result) =
            compile_source(factory, language, source, image_prefix).await?;
        if result.status != ExecStatus::Finished || result.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
            compile_sandbox.destroy().await;
            bail!(
                "checker compilation failed (status {:?}, exit {}): {stderr}",
                result.status,
                result.exit_code
            );
        }

        let image = format!("{image_prefix}{}", language.image_name);
        let mut sandbox = match factory
            .create(
                &image,
                CHECKER_TIME_LIMIT,
                CHECKER_MEMORY_LIMIT,
                &language.exec_command,
            )
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                compile_sandbox.destroy().await;
                return Err(e.into());
            }
        };

        let exe_path = format!("{WORKSPACE}{}", language.exe_file_name);
        let copied = compile_sandbox.copy_file_to(&exe_path, &mut sandbox).await;
        compile_sandbox.destroy().await;
        if let Err(e) = copied {
            sandbox.destroy().await;
            return Err(e.into());
        }

        Ok(Checker { sandbox })
    }

    /// Judges one case by running the checker with stdin made of the case
    /// input, the user's stdout, and the expected output, concatenated.
    ///
    /// Exit 0 means Accepted, a regular nonzero exit means WrongAnswer,
    /// anything else the checker did is the judge's problem, not the
    /// user's: UnknownError.
    pub async fn check(
        &mut self,
        input: &[u8],
        user_stdout: &[u8],
        expected: &[u8],
    ) -> JudgementStatus {
        let mut stdin = Vec::with_capacity(input.len() + user_stdout.len() + expected.len());
        stdin.extend_from_slice(input);
        stdin.extend_from_slice(user_stdout);
        stdin.extend_from_slice(expected);

        match self.sandbox.run(&stdin, false).await {
            Ok(result) => match result.status {
                ExecStatus::Finished if result.exit_code == 0 => JudgementStatus::Accepted,
                ExecStatus::Finished | ExecStatus::RuntimeError => JudgementStatus::WrongAnswer,
                status => {
                    log::error!("checker did not finish cleanly: {status:?}");
                    JudgementStatus::UnknownError
                }
            },
            Err(e) => {
                log::error!("checker run failed: {e}");
                JudgementStatus::UnknownError
            }
        }
    }

    pub async fn remove(&mut self) {
        self.sandbox.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{finished, finished_with_exit, MockBehavior, MockFactory};
    use crate::sandbox::ExecResult;

    fn checker_language() -> Language {
        Language {
            id: 9,
            name: "c".to_string(),
            image_name: "c".to_string(),
            source_file_name: "checker.c".to_string(),
            exe_file_name: "checker".to_string(),
            compile_command: vec!["gcc".to_string(), "checker.c".to_string()],
            exec_command: vec!["./checker".to_string()],
        }
    }

    #[tokio::test]
    async fn build_compiles_then_reuses_one_exec_sandbox() {
        let factory = MockFactory::new(vec![
            MockBehavior::Runs(vec![finished(Vec::new())]),
            MockBehavior::Respond(Box::new(|stdin: &[u8]| {
                if stdin.starts_with(b"good") {
                    finished(Vec::new())
                } else {
                    finished_with_exit(1)
                }
            })),
        ]);

        let mut checker = Checker::build(&factory, "int main(){}", &checker_language(), "img-")
            .await
            .unwrap();
        assert_eq!(factory.created_count(), 2);

        assert_eq!(
            checker.check(b"good ", b"out ", b"exp").await,
            JudgementStatus::Accepted
        );
        assert_eq!(
            checker.check(b"bad ", b"out ", b"exp").await,
            JudgementStatus::WrongAnswer
        );

        checker.remove().await;
        assert!(factory.all_destroyed());
    }

    #[tokio::test]
    async fn checker_compile_failure_destroys_sandbox_and_errors() {
        let factory = MockFactory::new(vec![MockBehavior::Runs(vec![ExecResult {
            status: ExecStatus::RuntimeError,
            exit_code: 1,
            ..finished(Vec::new())
        }])]);

        let result = Checker::build(&factory, "nonsense", &checker_language(), "img-").await;
        assert!(result.is_err());
        assert!(factory.all_destroyed());
    }

    #[tokio::test]
    async fn misbehaving_checker_is_unknown_error() {
        let factory = MockFactory::new(vec![
            MockBehavior::Runs(vec![finished(Vec::new())]),
            MockBehavior::Runs(vec![ExecResult {
                status: ExecStatus::TimeLimitExceeded,
                ..finished(Vec::new())
            }]),
        ]);

        let mut checker = Checker::build(&factory, "int main(){}", &checker_language(), "img-")
            .await
            .unwrap();
        assert_eq!(
            checker.check(b"in", b"out", b"exp").await,
            JudgementStatus::UnknownError
        );
        checker.remove().await;
    }

    #[tokio::test]
    async fn exec_sandbox_create_failure_destroys_compile_sandbox() {
        let factory = MockFactory::new(vec![
            MockBehavior::Runs(vec![finished(Vec::new())]),
            MockBehavior::FailCreate,
        ]);

        let result = Checker::build(&factory, "int main(){}", &checker_language(), "img-").await;
        assert!(result.is_err());
        assert!(factory.all_destroyed());
    }

    #[tokio::test]
    async fn checker_receives_concatenated_streams() {
        let factory = MockFactory::new(vec![
            MockBehavior::Runs(vec![finished(Vec::new())]),
            MockBehavior::Respond(Box::new(|stdin: &[u8]| {
                assert_eq!(stdin, b"1 2\n3\n3\n");
                finished(Vec::new())
            })),
        ]);

        let mut checker = Checker::build(&factory, "int main(){}", &checker_language(), "img-")
            .await
            .unwrap();
        checker.check(b"1 2\n", b"3\n", b"3\n").await;
        checker.remove().await;
    }
}
