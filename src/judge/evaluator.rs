use anyhow::{anyhow, Context};

use crate::models::{
    CaseSet, JudgeType, JudgementConfig, JudgementStatus, Language, Problem, TestCase,
};
use crate::sandbox::{ExecResult, ExecStatus, Sandbox, SandboxFactory};

use super::precision::outputs_match;
use super::special::Checker;

/// Per-case classification strategy, picked by the problem's judge type.
///
/// Only the Special variant owns sandbox resources; `remove` must be
/// called before the judgement job finishes.
pub enum CaseJudger<S: Sandbox> {
    Exact,
    Precision {
        absolute: Option<f64>,
        relative: Option<f64>,
    },
    Special {
        checker: Checker<S>,
    },
}

impl<S: Sandbox> CaseJudger<S> {
    /// Builds the judger for `problem`. For a special judge this compiles
    /// the checker, which can fail; the caller turns that into an
    /// UnknownError submission.
    pub async fn new<F>(
        factory: &F,
        problem: &Problem,
        config: &JudgementConfig,
        checker_language: Option<&Language>,
        image_prefix: &str,
    ) -> anyhow::Result<Self>
    where
        F: SandboxFactory<Sandbox = S>,
    {
        match problem.judge_type {
            JudgeType::Normal => Ok(CaseJudger::Exact),
            JudgeType::Precision => Ok(CaseJudger::Precision {
                absolute: config.absolute_tolerance,
                relative: config.relative_tolerance,
            }),
            JudgeType::Special => {
                let source = config
                    .checker_source
                    .as_deref()
                    .ok_or_else(|| anyhow!("special judge without checker source"))?;
                let language = checker_language
                    .ok_or_else(|| anyhow!("special judge without checker language"))?;
                let checker = Checker::build(factory, source, language, image_prefix)
                    .await
                    .context("checker construction failed")?;
                Ok(CaseJudger::Special { checker })
            }
        }
    }

    /// Classifies one case from its execution result.
    ///
    /// An absent result (tolerated missing tail block) and a sandbox
    /// status other than Finished both decide the verdict before any
    /// output comparison happens.
    pub async fn classify(
        &mut self,
        result: Option<&ExecResult>,
        test_case: &TestCase,
    ) -> JudgementStatus {
        let Some(result) = result else {
            return JudgementStatus::UnknownError;
        };
        match result.status {
            ExecStatus::MemoryLimitExceeded => JudgementStatus::MemoryLimitExceeded,
            ExecStatus::TimeLimitExceeded => JudgementStatus::TimeLimitExceeded,
            ExecStatus::RuntimeError => JudgementStatus::RuntimeError,
            ExecStatus::OutputLimitExceeded => JudgementStatus::OutputLimitExceeded,
            ExecStatus::InternalError => JudgementStatus::UnknownError,
            ExecStatus::Finished => match self {
                CaseJudger::Exact => classify_exact(&result.stdout, &test_case.output),
                CaseJudger::Precision { absolute, relative } => {
                    if outputs_match(&result.stdout, &test_case.output, *absolute, *relative) {
                        JudgementStatus::Accepted
                    } else {
                        JudgementStatus::WrongAnswer
                    }
                }
                CaseJudger::Special { checker } => {
                    checker
                        .check(&test_case.input, &result.stdout, &test_case.output)
                        .await
                }
            },
        }
    }

    /// Releases per-evaluator sandbox resources.
    pub async fn remove(&mut self) {
        if let CaseJudger::Special { checker } = self {
            checker.remove().await;
        }
    }
}

fn classify_exact(stdout: &[u8], expected: &[u8]) -> JudgementStatus {
    if stdout == expected {
        JudgementStatus::Accepted
    } else if stdout.trim_ascii() == expected.trim_ascii() {
        JudgementStatus::PresentationError
    } else {
        JudgementStatus::WrongAnswer
    }
}

/// Folds one case set's per-case verdicts into a set verdict and point.
///
/// The set point is all or nothing: awarded exactly when every case in the
/// set is Accepted.
pub struct CaseSetEvaluator {
    set_point: i64,
    statuses: Vec<JudgementStatus>,
}

impl CaseSetEvaluator {
    pub fn new(set: &CaseSet) -> Self {
        CaseSetEvaluator {
            set_point: set.point,
            statuses: Vec::new(),
        }
    }

    pub async fn next<S: Sandbox>(
        &mut self,
        judger: &mut CaseJudger<S>,
        result: Option<&ExecResult>,
        test_case: &TestCase,
    ) -> JudgementStatus {
        let status = judger.classify(result, test_case).await;
        self.statuses.push(status);
        status
    }

    pub fn evaluate(&self) -> (JudgementStatus, i64) {
        let status = JudgementStatus::fold(self.statuses.iter().copied());
        let point = if status == JudgementStatus::Accepted {
            self.set_point
        } else {
            0
        };
        (status, point)
    }
}

/// Folds case-set verdicts into the submission verdict and total point.
#[derive(Default)]
pub struct SubmissionEvaluator {
    statuses: Vec<JudgementStatus>,
    point: i64,
}

impl SubmissionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold_set(&mut self, status: JudgementStatus, point: i64) {
        self.statuses.push(status);
        self.point += point;
    }

    pub fn evaluate(&self) -> (JudgementStatus, i64) {
        (
            JudgementStatus::fold(self.statuses.iter().copied()),
            self.point,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{finished, MockSandbox};

    fn test_case(input: &[u8], output: &[u8]) -> TestCase {
        TestCase {
            id: 1,
            case_set_id: 1,
            input: input.to_vec(),
            output: output.to_vec(),
        }
    }

    fn exact() -> CaseJudger<MockSandbox> {
        CaseJudger::Exact
    }

    #[tokio::test]
    async fn exact_match_is_accepted() {
        let case = test_case(b"1 2\n", b"3\n");
        let status = exact().classify(Some(&finished(b"3\n")), &case).await;
        assert_eq!(status, JudgementStatus::Accepted);
    }

    #[tokio::test]
    async fn whitespace_padding_is_presentation_error() {
        let case = test_case(b"1 2\n", b"3\n");
        let status = exact().classify(Some(&finished(b" 3\n")), &case).await;
        assert_eq!(status, JudgementStatus::PresentationError);
    }

    #[tokio::test]
    async fn different_output_is_wrong_answer() {
        let case = test_case(b"1 2\n", b"3\n");
        let status = exact().classify(Some(&finished(b"4\n")), &case).await;
        assert_eq!(status, JudgementStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn inner_whitespace_differences_are_wrong_answer() {
        let case = test_case(b"", b"a b\n");
        let status = exact().classify(Some(&finished(b"a  b\n")), &case).await;
        assert_eq!(status, JudgementStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn sandbox_statuses_map_directly() {
        let case = test_case(b"", b"");
        for (exec, expected) in [
            (
                ExecStatus::TimeLimitExceeded,
                JudgementStatus::TimeLimitExceeded,
            ),
            (
                ExecStatus::MemoryLimitExceeded,
                JudgementStatus::MemoryLimitExceeded,
            ),
            (ExecStatus::RuntimeError, JudgementStatus::RuntimeError),
            (
                ExecStatus::OutputLimitExceeded,
                JudgementStatus::OutputLimitExceeded,
            ),
            (ExecStatus::InternalError, JudgementStatus::UnknownError),
        ] {
            let result = ExecResult {
                status: exec,
                ..finished(b"whatever")
            };
            assert_eq!(exact().classify(Some(&result), &case).await, expected);
        }
    }

    #[tokio::test]
    async fn absent_result_is_unknown_error() {
        let case = test_case(b"", b"");
        assert_eq!(
            exact().classify(None, &case).await,
            JudgementStatus::UnknownError
        );
    }

    #[tokio::test]
    async fn precision_judger_accepts_within_tolerance() {
        let mut judger: CaseJudger<MockSandbox> = CaseJudger::Precision {
            absolute: Some(1e-6),
            relative: None,
        };
        let case = test_case(b"2\n", b"1.4142135\n");
        assert_eq!(
            judger
                .classify(Some(&finished(b"1.41421356\n")), &case)
                .await,
            JudgementStatus::Accepted
        );

        let mut strict: CaseJudger<MockSandbox> = CaseJudger::Precision {
            absolute: Some(1e-9),
            relative: None,
        };
        assert_eq!(
            strict.classify(Some(&finished(b"1.41421\n")), &case).await,
            JudgementStatus::WrongAnswer
        );
    }

    #[tokio::test]
    async fn full_set_pass_awards_the_set_point() {
        let set = CaseSet {
            id: 1,
            problem_id: 1,
            point: 100,
        };
        let mut judger = exact();
        let mut eval = CaseSetEvaluator::new(&set);
        for _ in 0..2 {
            let case = test_case(b"", b"ok\n");
            eval.next(&mut judger, Some(&finished(b"ok\n")), &case)
                .await;
        }
        assert_eq!(eval.evaluate(), (JudgementStatus::Accepted, 100));
    }

    #[tokio::test]
    async fn any_failure_zeroes_the_set_point() {
        let set = CaseSet {
            id: 1,
            problem_id: 1,
            point: 100,
        };
        let mut judger = exact();
        let mut eval = CaseSetEvaluator::new(&set);
        let case = test_case(b"", b"ok\n");
        eval.next(&mut judger, Some(&finished(b"ok\n")), &case)
            .await;
        eval.next(&mut judger, Some(&finished(b"no\n")), &case)
            .await;
        assert_eq!(eval.evaluate(), (JudgementStatus::WrongAnswer, 0));
    }

    #[test]
    fn empty_set_evaluates_to_unknown_error() {
        let set = CaseSet {
            id: 1,
            problem_id: 1,
            point: 50,
        };
        let eval = CaseSetEvaluator::new(&set);
        assert_eq!(eval.evaluate(), (JudgementStatus::UnknownError, 0));
    }

    #[test]
    fn submission_evaluator_sums_points_and_folds_statuses() {
        let mut eval = SubmissionEvaluator::new();
        eval.fold_set(JudgementStatus::Accepted, 30);
        eval.fold_set(JudgementStatus::Accepted, 70);
        assert_eq!(eval.evaluate(), (JudgementStatus::Accepted, 100));

        let mut eval = SubmissionEvaluator::new();
        eval.fold_set(JudgementStatus::Accepted, 30);
        eval.fold_set(JudgementStatus::TimeLimitExceeded, 0);
        assert_eq!(eval.evaluate(), (JudgementStatus::TimeLimitExceeded, 30));
    }

    #[test]
    fn submission_evaluator_with_no_sets_is_unknown_error() {
        let eval = SubmissionEvaluator::new();
        assert_eq!(eval.evaluate(), (JudgementStatus::UnknownError, 0));
    }
}
