use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict of one judged unit (test case, case set, or submission).
///
/// The variant order doubles as the folding priority: folding a set of
/// statuses takes the maximum, so any severe condition dominates and
/// `Accepted` survives only when every unit is `Accepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JudgementStatus {
    WaitingJudge,
    Judging,
    Accepted,
    PresentationError,
    WrongAnswer,
    OutputLimitExceeded,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    UnknownError,
}

impl JudgementStatus {
    /// Folds a multiset of statuses into the aggregate verdict.
    ///
    /// An empty input folds to `UnknownError`.
    pub fn fold<I>(statuses: I) -> JudgementStatus
    where
        I: IntoIterator<Item = JudgementStatus>,
    {
        statuses
            .into_iter()
            .max()
            .unwrap_or(JudgementStatus::UnknownError)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            JudgementStatus::WaitingJudge | JudgementStatus::Judging
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JudgementStatus::WaitingJudge => "WaitingJudge",
            JudgementStatus::Judging => "Judging",
            JudgementStatus::Accepted => "Accepted",
            JudgementStatus::PresentationError => "PresentationError",
            JudgementStatus::WrongAnswer => "WrongAnswer",
            JudgementStatus::OutputLimitExceeded => "OutputLimitExceeded",
            JudgementStatus::TimeLimitExceeded => "TimeLimitExceeded",
            JudgementStatus::MemoryLimitExceeded => "MemoryLimitExceeded",
            JudgementStatus::RuntimeError => "RuntimeError",
            JudgementStatus::CompileError => "CompileError",
            JudgementStatus::UnknownError => "UnknownError",
        }
    }
}

impl FromStr for JudgementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WaitingJudge" => Ok(JudgementStatus::WaitingJudge),
            "Judging" => Ok(JudgementStatus::Judging),
            "Accepted" => Ok(JudgementStatus::Accepted),
            "PresentationError" => Ok(JudgementStatus::PresentationError),
            "WrongAnswer" => Ok(JudgementStatus::WrongAnswer),
            "OutputLimitExceeded" => Ok(JudgementStatus::OutputLimitExceeded),
            "TimeLimitExceeded" => Ok(JudgementStatus::TimeLimitExceeded),
            "MemoryLimitExceeded" => Ok(JudgementStatus::MemoryLimitExceeded),
            "RuntimeError" => Ok(JudgementStatus::RuntimeError),
            "CompileError" => Ok(JudgementStatus::CompileError),
            "UnknownError" => Ok(JudgementStatus::UnknownError),
            other => Err(format!("unknown judgement status: {other}")),
        }
    }
}

impl fmt::Display for JudgementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Judging strategy of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeType {
    Normal,
    Precision,
    Special,
}

impl JudgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            JudgeType::Normal => "normal",
            JudgeType::Precision => "precision",
            JudgeType::Special => "special",
        }
    }
}

impl FromStr for JudgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(JudgeType::Normal),
            "precision" => Ok(JudgeType::Precision),
            "special" => Ok(JudgeType::Special),
            other => Err(format!("unknown judge type: {other}")),
        }
    }
}

/// One judgement request as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    pub language_id: i64,
    pub problem_id: i64,
    pub source_code: String,
    pub created_at: DateTime<Utc>,
    pub status: JudgementStatus,
    pub point: i64,
    pub exec_time: Duration,
    /// Peak memory over all test cases, in KiB.
    pub memory_usage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    pub id: i64,
    pub name: String,
    /// Sandbox image tag without the deployment prefix.
    pub image_name: String,
    pub source_file_name: String,
    pub exe_file_name: String,
    pub compile_command: Vec<String>,
    pub exec_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    pub time_limit: Duration,
    /// Memory limit in MiB.
    pub memory_limit: u64,
    pub judge_type: JudgeType,
    pub contest_id: Option<i64>,
}

impl Problem {
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit * 1024 * 1024
    }
}

/// Per-problem evaluator parameters, opaque to everything but the
/// matching judge type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgementConfig {
    pub problem_id: i64,
    pub absolute_tolerance: Option<f64>,
    pub relative_tolerance: Option<f64>,
    pub checker_source: Option<String>,
    pub checker_language_id: Option<i64>,
}

/// A scoring bucket of test cases. The point is awarded only when every
/// case in the set is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSet {
    pub id: i64,
    pub problem_id: i64,
    pub point: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub case_set_id: i64,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

/// Verdict row for one (submission, test case) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub id: i64,
    pub submission_id: i64,
    pub test_case_id: i64,
    pub status: JudgementStatus,
    pub exec_time: Duration,
    /// Peak memory of this case, in KiB.
    pub memory_usage: i64,
}

/// Verdict row for one (submission, case set) pair. Time and memory are
/// the maxima over the set's cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSetResult {
    pub id: i64,
    pub submission_id: i64,
    pub case_set_id: i64,
    pub status: JudgementStatus,
    pub point: i64,
    pub exec_time: Duration,
    pub memory_usage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub id: i64,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl Contest {
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        self.start_at <= at && at < self.end_at
    }
}
