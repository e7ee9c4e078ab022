use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sqlx::SqlitePool;

use crate::database as db;
use crate::models::{JudgementConfig, JudgementStatus, Language, Problem, Submission};
use crate::notify::{Notifier, ScoreHook};
use crate::sandbox::{
    ExecStatus, Sandbox, SandboxFactory, INPUT_DIR, JUDGE_SCRIPT_PATH, WORKSPACE,
};

use super::evaluator::{CaseJudger, CaseSetEvaluator, SubmissionEvaluator};
use super::parser::ExecResultParser;
use super::{compile_source, load_judge_script};

/// Everything a worker needs to judge submissions.
pub struct JudgeContext<F> {
    pub db: SqlitePool,
    pub factory: F,
    pub notifier: Notifier,
    pub score_hook: Arc<dyn ScoreHook>,
    pub image_prefix: String,
    pub judge_script: PathBuf,
}

/// One submission being driven through compile, per-set execution, and
/// verdict aggregation.
pub struct JudgementJob<'c, F: SandboxFactory> {
    ctx: &'c JudgeContext<F>,
    submission: Submission,
    language: Language,
    problem: Problem,
    config: JudgementConfig,
    checker_language: Option<Language>,
    sets: Vec<SetJudgement>,
}

struct SetJudgement {
    data: db::CaseSetData,
    shells: db::ResultShells,
}

struct SetOutcome {
    status: JudgementStatus,
    point: i64,
    exec_time: Duration,
    memory_usage: i64,
}

/// A set that could not be judged to completion. Cases processed before
/// the failure were already persisted, so their time/memory maxima must
/// still reach the submission-level accumulators.
struct SetFailure {
    error: anyhow::Error,
    exec_time: Duration,
    memory_usage: i64,
}

impl SetFailure {
    fn new(error: impl Into<anyhow::Error>, exec_time: Duration, memory_usage: i64) -> Self {
        SetFailure {
            error: error.into(),
            exec_time,
            memory_usage,
        }
    }
}

impl<'c, F: SandboxFactory> JudgementJob<'c, F> {
    /// Judges one submission to completion.
    ///
    /// Never fails: every outcome is converted into judgement statuses,
    /// persisted, and announced. A submission deleted while queued is a
    /// no-op.
    pub async fn run(ctx: &'c JudgeContext<F>, submission_id: i64) {
        let submission = match db::get_submission(&ctx.db, submission_id).await {
            Ok(Some(submission)) => submission,
            Ok(None) => {
                log::info!("submission {submission_id} is deleted, skipping");
                return;
            }
            Err(e) => {
                log::error!("failed to load submission {submission_id}: {e}");
                return;
            }
        };

        if let Err(e) =
            db::set_submission_status(&ctx.db, submission_id, JudgementStatus::Judging).await
        {
            log::error!("failed to mark submission {submission_id} as judging: {e}");
        }

        match Self::load(ctx, submission).await {
            Ok(job) => job.execute().await,
            Err((mut submission, e)) => {
                log::error!(
                    "failed to load judgement data for submission {submission_id}: {e:#}"
                );
                submission.status = JudgementStatus::UnknownError;
                submission.point = 0;
                submission.exec_time = Duration::ZERO;
                submission.memory_usage = 0;
                finalize(ctx, submission, None).await;
            }
        }
    }

    async fn load(
        ctx: &'c JudgeContext<F>,
        submission: Submission,
    ) -> Result<Self, (Submission, anyhow::Error)> {
        let loaded: anyhow::Result<_> = async {
            let language = db::get_language(&ctx.db, submission.language_id)
                .await?
                .ok_or_else(|| anyhow!("language {} not found", submission.language_id))?;
            let problem = db::get_problem(&ctx.db, submission.problem_id)
                .await?
                .ok_or_else(|| anyhow!("problem {} not found", submission.problem_id))?;
            let config = db::get_judgement_config(&ctx.db, problem.id).await?;
            let checker_language = match config.checker_language_id {
                Some(id) => db::get_language(&ctx.db, id).await?,
                None => None,
            };
            let data = db::load_case_sets(&ctx.db, problem.id).await?;
            let shells = db::create_result_shells(&ctx.db, submission.id, &data).await?;
            let sets = data
                .into_iter()
                .zip(shells)
                .map(|(data, shells)| SetJudgement { data, shells })
                .collect();
            Ok((language, problem, config, checker_language, sets))
        }
        .await;

        match loaded {
            Ok((language, problem, config, checker_language, sets)) => Ok(JudgementJob {
                ctx,
                submission,
                language,
                problem,
                config,
                checker_language,
                sets,
            }),
            Err(e) => Err((submission, e)),
        }
    }

    async fn execute(self) {
        let submission_id = self.submission.id;

        {
            let mut snapshot = self.submission.clone();
            snapshot.status = JudgementStatus::Judging;
            self.ctx
                .notifier
                .publish(self.problem.contest_id, &snapshot);
        }

        let mut exec_time = Duration::ZERO;
        let mut memory_usage: i64 = 0;
        let mut point: i64 = 0;
        let mut final_status = JudgementStatus::UnknownError;

        let mut judger = match CaseJudger::new(
            &self.ctx.factory,
            &self.problem,
            &self.config,
            self.checker_language.as_ref(),
            &self.ctx.image_prefix,
        )
        .await
        {
            Ok(judger) => judger,
            Err(e) => {
                log::error!(
                    "evaluator construction failed for submission {submission_id}: {e:#}"
                );
                self.mark_all(JudgementStatus::UnknownError).await;
                self.finish(final_status, point, exec_time, memory_usage)
                    .await;
                return;
            }
        };

        let mut submission_eval = SubmissionEvaluator::new();
        let mut compile_sandbox: Option<F::Sandbox> = None;

        match compile_source(
            &self.ctx.factory,
            &self.language,
            &self.submission.source_code,
            &self.ctx.image_prefix,
        )
        .await
        {
            Err(e) => {
                log::error!("compile failed for submission {submission_id}: {e}");
                self.mark_all(JudgementStatus::UnknownError).await;
            }
            Ok((sandbox, result))
                if result.status != ExecStatus::Finished || result.exit_code != 0 =>
            {
                log::debug!(
                    "compile error for submission {submission_id}: {:?} exit {}: {}",
                    result.status,
                    result.exit_code,
                    String::from_utf8_lossy(&result.stderr)
                );
                compile_sandbox = Some(sandbox);
                final_status = JudgementStatus::CompileError;
                self.mark_all(JudgementStatus::CompileError).await;
            }
            Ok((mut sandbox, _)) => {
                match load_judge_script(&self.ctx.judge_script).await {
                    Err(e) => {
                        log::error!("cannot judge submission {submission_id}: {e:#}");
                        submission_eval.fold_set(JudgementStatus::UnknownError, 0);
                    }
                    Ok(script) => {
                        for index in 0..self.sets.len() {
                            match self
                                .judge_case_set(index, &mut judger, &mut sandbox, &script)
                                .await
                            {
                                Ok(outcome) => {
                                    submission_eval.fold_set(outcome.status, outcome.point);
                                    exec_time = exec_time.max(outcome.exec_time);
                                    memory_usage = memory_usage.max(outcome.memory_usage);
                                }
                                Err(failure) => {
                                    log::error!(
                                        "case set {} of submission {submission_id} failed: {:#}",
                                        self.sets[index].data.case_set.id,
                                        failure.error
                                    );
                                    submission_eval.fold_set(JudgementStatus::UnknownError, 0);
                                    // Cases judged before the failure are
                                    // persisted; keep their maxima.
                                    exec_time = exec_time.max(failure.exec_time);
                                    memory_usage = memory_usage.max(failure.memory_usage);
                                    break;
                                }
                            }
                        }
                    }
                }
                compile_sandbox = Some(sandbox);
            }
        }

        if final_status != JudgementStatus::CompileError {
            let (status, total) = submission_eval.evaluate();
            final_status = status;
            point = total;
        }

        judger.remove().await;
        if let Some(mut sandbox) = compile_sandbox {
            sandbox.destroy().await;
        }

        self.finish(final_status, point, exec_time, memory_usage)
            .await;
    }

    /// Runs one case set in its own exec sandbox, which is destroyed on
    /// every path out of here.
    async fn judge_case_set(
        &self,
        index: usize,
        judger: &mut CaseJudger<F::Sandbox>,
        compiled: &mut F::Sandbox,
        script: &[u8],
    ) -> Result<SetOutcome, SetFailure> {
        let image = format!("{}{}", self.ctx.image_prefix, self.language.image_name);
        let mut sandbox = match self
            .ctx
            .factory
            .create_judgement(
                &image,
                self.problem.time_limit,
                self.problem.memory_limit_bytes(),
                &self.language.exec_command,
                &self.language.exe_file_name,
            )
            .await
            .context("exec sandbox create failed")
        {
            Ok(sandbox) => sandbox,
            Err(e) => return Err(SetFailure::new(e, Duration::ZERO, 0)),
        };

        let outcome = self
            .judge_case_set_inner(&self.sets[index], judger, compiled, script, &mut sandbox)
            .await;
        sandbox.destroy().await;
        outcome
    }

    async fn judge_case_set_inner(
        &self,
        set: &SetJudgement,
        judger: &mut CaseJudger<F::Sandbox>,
        compiled: &mut F::Sandbox,
        script: &[u8],
        sandbox: &mut F::Sandbox,
    ) -> Result<SetOutcome, SetFailure> {
        if let Err(e) = sandbox.inject_file(script, JUDGE_SCRIPT_PATH).await {
            return Err(SetFailure::new(e, Duration::ZERO, 0));
        }

        // Inputs go in under a freshly seeded shuffle so user code cannot
        // tell cases apart by position. The parser yields blocks in the
        // same order, which attaches each verdict to the right case.
        let mut order: Vec<usize> = (0..set.data.cases.len()).collect();
        let mut rng = StdRng::from_entropy();
        order.shuffle(&mut rng);

        for (slot, &case_index) in order.iter().enumerate() {
            let input = &set.data.cases[case_index].input;
            if let Err(e) = sandbox
                .inject_file(input, &format!("{INPUT_DIR}{slot}.txt"))
                .await
            {
                return Err(SetFailure::new(e, Duration::ZERO, 0));
            }
        }

        let exe_path = format!("{WORKSPACE}{}", self.language.exe_file_name);
        if let Err(e) = compiled.copy_file_to(&exe_path, sandbox).await {
            return Err(SetFailure::new(e, Duration::ZERO, 0));
        }

        let run_result = match sandbox.run(b"", true).await {
            Ok(result) => result,
            Err(e) => return Err(SetFailure::new(e, Duration::ZERO, 0)),
        };
        let mut parser = ExecResultParser::new(
            run_result.stdout,
            self.problem.time_limit,
            self.problem.memory_limit_bytes(),
        );

        let mut set_eval = CaseSetEvaluator::new(&set.data.case_set);
        let mut max_time = Duration::ZERO;
        let mut max_memory: i64 = 0;

        for (slot, &case_index) in order.iter().enumerate() {
            // From here on cases are persisted as they are judged, so an
            // early return must carry the maxima gathered so far.
            let result = match parser.next() {
                Ok(result) => result,
                Err(e) => return Err(SetFailure::new(e, max_time, max_memory)),
            };
            if result.is_none() && slot != order.len() - 1 {
                // Only the final block may be missing (runner killed by the
                // outer cap mid-emission); anything earlier is fatal.
                return Err(SetFailure::new(
                    anyhow!(
                        "batch runner output ended early: block {slot} of {} missing",
                        order.len()
                    ),
                    max_time,
                    max_memory,
                ));
            }

            let test_case = &set.data.cases[case_index];
            let status = set_eval.next(judger, result.as_ref(), test_case).await;
            let case_time = result.as_ref().map(|r| r.exec_time).unwrap_or_default();
            let case_memory = result
                .as_ref()
                .map(|r| (r.memory_usage / 1024) as i64)
                .unwrap_or_default();

            max_time = max_time.max(case_time);
            max_memory = max_memory.max(case_memory);

            let row_id = set.shells.case_result_ids[case_index];
            if let Err(e) =
                db::update_judge_result(&self.ctx.db, row_id, status, case_time, case_memory).await
            {
                log::error!("failed to persist case result {row_id}: {e}");
            }
        }

        let (set_status, set_point) = set_eval.evaluate();
        if let Err(e) = db::update_judge_set_result(
            &self.ctx.db,
            set.shells.set_result_id,
            set_status,
            set_point,
            max_time,
            max_memory,
        )
        .await
        {
            log::error!(
                "failed to persist set result {}: {e}",
                set.shells.set_result_id
            );
        }

        Ok(SetOutcome {
            status: set_status,
            point: set_point,
            exec_time: max_time,
            memory_usage: max_memory,
        })
    }

    async fn mark_all(&self, status: JudgementStatus) {
        if let Err(e) = db::mark_all_results(&self.ctx.db, self.submission.id, status).await {
            log::error!(
                "failed to mark results of submission {}: {e}",
                self.submission.id
            );
        }
    }

    async fn finish(
        mut self,
        status: JudgementStatus,
        point: i64,
        exec_time: Duration,
        memory_usage: i64,
    ) {
        self.submission.status = status;
        self.submission.point = point;
        self.submission.exec_time = exec_time;
        self.submission.memory_usage = memory_usage;
        let contest_id = self.problem.contest_id;
        finalize(self.ctx, self.submission, contest_id).await;
    }
}

/// The infallible tail of every judgement: persist the submission row,
/// announce the status change, and fire the contest score hook when the
/// submission counts.
async fn finalize<F>(ctx: &JudgeContext<F>, submission: Submission, contest_id: Option<i64>) {
    if let Err(e) = db::finalize_submission(
        &ctx.db,
        submission.id,
        submission.status,
        submission.point,
        submission.exec_time,
        submission.memory_usage,
    )
    .await
    {
        log::error!(
            "failed to persist final state of submission {}: {e}",
            submission.id
        );
    }

    ctx.notifier.publish(contest_id, &submission);

    let Some(contest_id) = contest_id else { return };
    let contest = match db::get_contest(&ctx.db, contest_id).await {
        Ok(Some(contest)) => contest,
        Ok(None) => {
            log::error!("contest {contest_id} not found");
            return;
        }
        Err(e) => {
            log::error!("failed to load contest {contest_id}: {e}");
            return;
        }
    };
    let writer = match db::is_contest_writer(&ctx.db, contest_id, submission.user_id).await {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("failed to check contest writers for {contest_id}: {e}");
            return;
        }
    };
    if contest.is_open(submission.created_at) && !writer {
        ctx.score_hook.update_score(&submission, contest_id).await;
    }
}
