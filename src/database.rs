use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::models::{
    CaseSet, Contest, JudgeType, JudgementConfig, JudgementStatus, Language, Problem, Submission,
    TestCase,
};

const DATABASE_NAME: &str = "koneko-judge.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "koneko-judge").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS languages (
        id                INTEGER PRIMARY KEY,
        name              TEXT    NOT NULL UNIQUE,
        image_name        TEXT    NOT NULL,
        source_file_name  TEXT    NOT NULL,
        exe_file_name     TEXT    NOT NULL,
        compile_command   TEXT    NOT NULL,
        exec_command      TEXT    NOT NULL
    );",
    r"
    CREATE TABLE IF NOT EXISTS contests (
        id        INTEGER PRIMARY KEY,
        title     TEXT    NOT NULL,
        start_at  TEXT    NOT NULL,
        end_at    TEXT    NOT NULL
    );",
    r"
    CREATE TABLE IF NOT EXISTS contest_writers (
        contest_id  INTEGER NOT NULL,
        user_id     INTEGER NOT NULL,
        PRIMARY KEY (contest_id, user_id),
        FOREIGN KEY (contest_id) REFERENCES contests (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS problems (
        id                INTEGER PRIMARY KEY,
        time_limit_ms     INTEGER NOT NULL,
        memory_limit_mib  INTEGER NOT NULL,
        judge_type        TEXT    NOT NULL,
        contest_id        INTEGER,
        FOREIGN KEY (contest_id) REFERENCES contests (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS judgement_configs (
        problem_id           INTEGER PRIMARY KEY,
        absolute_tolerance   REAL,
        relative_tolerance   REAL,
        checker_source       TEXT,
        checker_language_id  INTEGER,
        FOREIGN KEY (problem_id) REFERENCES problems (id),
        FOREIGN KEY (checker_language_id) REFERENCES languages (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS case_sets (
        id          INTEGER PRIMARY KEY,
        problem_id  INTEGER NOT NULL,
        point       INTEGER NOT NULL,
        FOREIGN KEY (problem_id) REFERENCES problems (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS test_cases (
        id           INTEGER PRIMARY KEY,
        case_set_id  INTEGER NOT NULL,
        input        BLOB    NOT NULL,
        output       BLOB    NOT NULL,
        FOREIGN KEY (case_set_id) REFERENCES case_sets (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS submissions (
        id            INTEGER PRIMARY KEY,
        user_id       INTEGER NOT NULL,
        language_id   INTEGER NOT NULL,
        problem_id    INTEGER NOT NULL,
        source_code   TEXT    NOT NULL,
        created_at    TEXT    NOT NULL,
        status        TEXT    NOT NULL,
        point         INTEGER NOT NULL DEFAULT 0,
        exec_time_ms  INTEGER NOT NULL DEFAULT 0,
        memory_kib    INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (language_id) REFERENCES languages (id),
        FOREIGN KEY (problem_id)  REFERENCES problems (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS judge_set_results (
        id             INTEGER PRIMARY KEY,
        submission_id  INTEGER NOT NULL,
        case_set_id    INTEGER NOT NULL,
        status         TEXT    NOT NULL,
        point          INTEGER NOT NULL DEFAULT 0,
        exec_time_ms   INTEGER NOT NULL DEFAULT 0,
        memory_kib     INTEGER NOT NULL DEFAULT 0,
        UNIQUE (submission_id, case_set_id),
        FOREIGN KEY (submission_id) REFERENCES submissions (id),
        FOREIGN KEY (case_set_id)   REFERENCES case_sets (id)
    );",
    r"
    CREATE TABLE IF NOT EXISTS judge_results (
        id             INTEGER PRIMARY KEY,
        submission_id  INTEGER NOT NULL,
        test_case_id   INTEGER NOT NULL,
        status         TEXT    NOT NULL,
        exec_time_ms   INTEGER NOT NULL DEFAULT 0,
        memory_kib     INTEGER NOT NULL DEFAULT 0,
        UNIQUE (submission_id, test_case_id),
        FOREIGN KEY (submission_id) REFERENCES submissions (id),
        FOREIGN KEY (test_case_id)  REFERENCES test_cases (id)
    );",
];

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let pool = connect_and_migrate(&db_url, 2).await?;
    log::info!("Initialized database at {}", db_path.as_ref().display());
    Ok(pool)
}

/// In-memory database for tests; a single connection keeps it alive.
pub async fn init_memory_db() -> sqlx::Result<SqlitePool> {
    connect_and_migrate("sqlite::memory:", 1).await
}

async fn connect_and_migrate(db_url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&pool).await?;
    }

    let mut tx = pool.begin().await?;
    for sql in SCHEMA {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }
    tx.commit().await?;

    Ok(pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_err(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn status_column(row: &SqliteRow, column: &str) -> sqlx::Result<JudgementStatus> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(decode_err)
}

fn command_column(row: &SqliteRow, column: &str) -> sqlx::Result<Vec<String>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| decode_err(format!("bad command tokens: {e}")))
}

fn command_json(tokens: &[String]) -> String {
    serde_json::to_string(tokens).expect("command tokens are always serializable")
}

fn duration_ms(row: &SqliteRow, column: &str) -> sqlx::Result<Duration> {
    let ms: i64 = row.try_get(column)?;
    Ok(Duration::from_millis(ms.max(0) as u64))
}

// ---------------------------------------------------------------------------
// Submissions

pub async fn get_submission(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Submission>> {
    sqlx::query(
        r"
        SELECT id, user_id, language_id, problem_id, source_code, created_at,
               status, point, exec_time_ms, memory_kib
        FROM submissions
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(|row| submission_from_row(&row))
    .transpose()
}

fn submission_from_row(row: &SqliteRow) -> sqlx::Result<Submission> {
    Ok(Submission {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        language_id: row.try_get("language_id")?,
        problem_id: row.try_get("problem_id")?,
        source_code: row.try_get("source_code")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        status: status_column(row, "status")?,
        point: row.try_get("point")?,
        exec_time: duration_ms(row, "exec_time_ms")?,
        memory_usage: row.try_get("memory_kib")?,
    })
}

/// Creates a submission in `WaitingJudge`, ready for the queue.
pub async fn create_submission(
    pool: &SqlitePool,
    user_id: i64,
    language_id: i64,
    problem_id: i64,
    source_code: &str,
) -> sqlx::Result<i64> {
    let row = sqlx::query(
        r"
        INSERT INTO submissions (user_id, language_id, problem_id, source_code, created_at, status)
        VALUES (?, ?, ?, ?, ?, 'WaitingJudge')
        RETURNING id
        ",
    )
    .bind(user_id)
    .bind(language_id)
    .bind(problem_id)
    .bind(source_code)
    .bind(now_rfc3339())
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

pub async fn set_submission_status(
    pool: &SqlitePool,
    id: i64,
    status: JudgementStatus,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE submissions SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The submission-level finalisation write.
pub async fn finalize_submission(
    pool: &SqlitePool,
    id: i64,
    status: JudgementStatus,
    point: i64,
    exec_time: Duration,
    memory_kib: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, point = ?, exec_time_ms = ?, memory_kib = ?
        WHERE id = ?
        ",
    )
    .bind(status.as_str())
    .bind(point)
    .bind(exec_time.as_millis() as i64)
    .bind(memory_kib)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Submissions still waiting for a worker, oldest first. Used to refill
/// the queue after a restart.
pub async fn waiting_submission_ids(pool: &SqlitePool) -> sqlx::Result<Vec<i64>> {
    let rows = sqlx::query("SELECT id FROM submissions WHERE status = 'WaitingJudge' ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(|row| row.try_get("id")).collect()
}

// ---------------------------------------------------------------------------
// Problem graph

pub async fn get_language(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Language>> {
    sqlx::query(
        r"
        SELECT id, name, image_name, source_file_name, exe_file_name,
               compile_command, exec_command
        FROM languages
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(|row| {
        Ok(Language {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            image_name: row.try_get("image_name")?,
            source_file_name: row.try_get("source_file_name")?,
            exe_file_name: row.try_get("exe_file_name")?,
            compile_command: command_column(&row, "compile_command")?,
            exec_command: command_column(&row, "exec_command")?,
        })
    })
    .transpose()
}

pub async fn insert_language(pool: &SqlitePool, language: &Language) -> sqlx::Result<i64> {
    let row = sqlx::query(
        r"
        INSERT INTO languages (name, image_name, source_file_name, exe_file_name,
                               compile_command, exec_command)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        ",
    )
    .bind(&language.name)
    .bind(&language.image_name)
    .bind(&language.source_file_name)
    .bind(&language.exe_file_name)
    .bind(command_json(&language.compile_command))
    .bind(command_json(&language.exec_command))
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

pub async fn get_problem(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Problem>> {
    sqlx::query(
        "SELECT id, time_limit_ms, memory_limit_mib, judge_type, contest_id FROM problems WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(|row| {
        let judge_type: String = row.try_get("judge_type")?;
        Ok(Problem {
            id: row.try_get("id")?,
            time_limit: duration_ms(&row, "time_limit_ms")?,
            memory_limit: row.try_get::<i64, _>("memory_limit_mib")? as u64,
            judge_type: judge_type.parse::<JudgeType>().map_err(decode_err)?,
            contest_id: row.try_get("contest_id")?,
        })
    })
    .transpose()
}

pub async fn insert_problem(pool: &SqlitePool, problem: &Problem) -> sqlx::Result<i64> {
    let row = sqlx::query(
        r"
        INSERT INTO problems (time_limit_ms, memory_limit_mib, judge_type, contest_id)
        VALUES (?, ?, ?, ?)
        RETURNING id
        ",
    )
    .bind(problem.time_limit.as_millis() as i64)
    .bind(problem.memory_limit as i64)
    .bind(problem.judge_type.as_str())
    .bind(problem.contest_id)
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

/// The per-problem evaluator parameters; a missing row means defaults.
pub async fn get_judgement_config(
    pool: &SqlitePool,
    problem_id: i64,
) -> sqlx::Result<JudgementConfig> {
    let row = sqlx::query(
        r"
        SELECT problem_id, absolute_tolerance, relative_tolerance,
               checker_source, checker_language_id
        FROM judgement_configs
        WHERE problem_id = ?
        ",
    )
    .bind(problem_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(JudgementConfig {
            problem_id: row.try_get("problem_id")?,
            absolute_tolerance: row.try_get("absolute_tolerance")?,
            relative_tolerance: row.try_get("relative_tolerance")?,
            checker_source: row.try_get("checker_source")?,
            checker_language_id: row.try_get("checker_language_id")?,
        }),
        None => Ok(JudgementConfig {
            problem_id,
            ..JudgementConfig::default()
        }),
    }
}

pub async fn upsert_judgement_config(
    pool: &SqlitePool,
    config: &JudgementConfig,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO judgement_configs (problem_id, absolute_tolerance, relative_tolerance,
                                       checker_source, checker_language_id)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (problem_id) DO UPDATE SET
            absolute_tolerance = excluded.absolute_tolerance,
            relative_tolerance = excluded.relative_tolerance,
            checker_source = excluded.checker_source,
            checker_language_id = excluded.checker_language_id
        ",
    )
    .bind(config.problem_id)
    .bind(config.absolute_tolerance)
    .bind(config.relative_tolerance)
    .bind(&config.checker_source)
    .bind(config.checker_language_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// One case set together with its test cases, in declaration order.
pub struct CaseSetData {
    pub case_set: CaseSet,
    pub cases: Vec<TestCase>,
}

pub async fn load_case_sets(pool: &SqlitePool, problem_id: i64) -> sqlx::Result<Vec<CaseSetData>> {
    let set_rows = sqlx::query("SELECT id, problem_id, point FROM case_sets WHERE problem_id = ? ORDER BY id")
        .bind(problem_id)
        .fetch_all(pool)
        .await?;

    let mut sets = Vec::with_capacity(set_rows.len());
    for row in set_rows {
        let case_set = CaseSet {
            id: row.try_get("id")?,
            problem_id: row.try_get("problem_id")?,
            point: row.try_get("point")?,
        };
        let case_rows =
            sqlx::query("SELECT id, case_set_id, input, output FROM test_cases WHERE case_set_id = ? ORDER BY id")
                .bind(case_set.id)
                .fetch_all(pool)
                .await?;
        let mut cases = Vec::with_capacity(case_rows.len());
        for case_row in case_rows {
            cases.push(TestCase {
                id: case_row.try_get("id")?,
                case_set_id: case_row.try_get("case_set_id")?,
                input: case_row.try_get("input")?,
                output: case_row.try_get("output")?,
            });
        }
        sets.push(CaseSetData { case_set, cases });
    }
    Ok(sets)
}

pub async fn insert_case_set(pool: &SqlitePool, case_set: &CaseSet) -> sqlx::Result<i64> {
    let row = sqlx::query("INSERT INTO case_sets (problem_id, point) VALUES (?, ?) RETURNING id")
        .bind(case_set.problem_id)
        .bind(case_set.point)
        .fetch_one(pool)
        .await?;
    row.try_get("id")
}

pub async fn insert_test_case(pool: &SqlitePool, test_case: &TestCase) -> sqlx::Result<i64> {
    let row = sqlx::query(
        "INSERT INTO test_cases (case_set_id, input, output) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(test_case.case_set_id)
    .bind(&test_case.input)
    .bind(&test_case.output)
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

// ---------------------------------------------------------------------------
// Judgement results

/// Blank result rows for one case set, created when a job starts.
pub struct ResultShells {
    pub set_result_id: i64,
    /// One id per test case, in the set's declaration order.
    pub case_result_ids: Vec<i64>,
}

/// Creates (or resets) the result rows for every case of every set, all in
/// `UnknownError` so an aborted judgement still leaves terminal rows.
pub async fn create_result_shells(
    pool: &SqlitePool,
    submission_id: i64,
    sets: &[CaseSetData],
) -> sqlx::Result<Vec<ResultShells>> {
    let mut shells = Vec::with_capacity(sets.len());
    for set in sets {
        let row = sqlx::query(
            r"
            INSERT INTO judge_set_results (submission_id, case_set_id, status)
            VALUES (?, ?, 'UnknownError')
            ON CONFLICT (submission_id, case_set_id) DO UPDATE SET
                status = 'UnknownError', point = 0, exec_time_ms = 0, memory_kib = 0
            RETURNING id
            ",
        )
        .bind(submission_id)
        .bind(set.case_set.id)
        .fetch_one(pool)
        .await?;
        let set_result_id: i64 = row.try_get("id")?;

        let mut case_result_ids = Vec::with_capacity(set.cases.len());
        for case in &set.cases {
            let row = sqlx::query(
                r"
                INSERT INTO judge_results (submission_id, test_case_id, status)
                VALUES (?, ?, 'UnknownError')
                ON CONFLICT (submission_id, test_case_id) DO UPDATE SET
                    status = 'UnknownError', exec_time_ms = 0, memory_kib = 0
                RETURNING id
                ",
            )
            .bind(submission_id)
            .bind(case.id)
            .fetch_one(pool)
            .await?;
            case_result_ids.push(row.try_get("id")?);
        }
        shells.push(ResultShells {
            set_result_id,
            case_result_ids,
        });
    }
    Ok(shells)
}

pub async fn update_judge_result(
    pool: &SqlitePool,
    id: i64,
    status: JudgementStatus,
    exec_time: Duration,
    memory_kib: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE judge_results SET status = ?, exec_time_ms = ?, memory_kib = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(exec_time.as_millis() as i64)
        .bind(memory_kib)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_judge_set_result(
    pool: &SqlitePool,
    id: i64,
    status: JudgementStatus,
    point: i64,
    exec_time: Duration,
    memory_kib: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE judge_set_results
        SET status = ?, point = ?, exec_time_ms = ?, memory_kib = ?
        WHERE id = ?
        ",
    )
    .bind(status.as_str())
    .bind(point)
    .bind(exec_time.as_millis() as i64)
    .bind(memory_kib)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stamps every set and case row of a submission with one status, for the
/// paths where no case ever ran (compile error, broken evaluator).
pub async fn mark_all_results(
    pool: &SqlitePool,
    submission_id: i64,
    status: JudgementStatus,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE judge_set_results SET status = ? WHERE submission_id = ?")
        .bind(status.as_str())
        .bind(submission_id)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE judge_results SET status = ? WHERE submission_id = ?")
        .bind(status.as_str())
        .bind(submission_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Per-case verdict rows of one submission, keyed by judge_results.id.
pub async fn get_judge_result_row(
    pool: &SqlitePool,
    id: i64,
) -> sqlx::Result<Option<(JudgementStatus, Duration, i64)>> {
    sqlx::query("SELECT status, exec_time_ms, memory_kib FROM judge_results WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| {
            Ok((
                status_column(&row, "status")?,
                duration_ms(&row, "exec_time_ms")?,
                row.try_get("memory_kib")?,
            ))
        })
        .transpose()
}

pub async fn get_judge_set_result_row(
    pool: &SqlitePool,
    id: i64,
) -> sqlx::Result<Option<(JudgementStatus, i64, Duration, i64)>> {
    sqlx::query("SELECT status, point, exec_time_ms, memory_kib FROM judge_set_results WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| {
            Ok((
                status_column(&row, "status")?,
                row.try_get("point")?,
                duration_ms(&row, "exec_time_ms")?,
                row.try_get("memory_kib")?,
            ))
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// Contests

pub async fn get_contest(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Contest>> {
    sqlx::query("SELECT id, title, start_at, end_at FROM contests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| {
            Ok(Contest {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                start_at: row.try_get::<DateTime<Utc>, _>("start_at")?,
                end_at: row.try_get::<DateTime<Utc>, _>("end_at")?,
            })
        })
        .transpose()
}

pub async fn insert_contest(pool: &SqlitePool, contest: &Contest) -> sqlx::Result<i64> {
    let row =
        sqlx::query("INSERT INTO contests (title, start_at, end_at) VALUES (?, ?, ?) RETURNING id")
            .bind(&contest.title)
            .bind(contest.start_at)
            .bind(contest.end_at)
            .fetch_one(pool)
            .await?;
    row.try_get("id")
}

pub async fn add_contest_writer(
    pool: &SqlitePool,
    contest_id: i64,
    user_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO contest_writers (contest_id, user_id) VALUES (?, ?)")
        .bind(contest_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn is_contest_writer(
    pool: &SqlitePool,
    contest_id: i64,
    user_id: i64,
) -> sqlx::Result<bool> {
    let row = sqlx::query("SELECT 1 FROM contest_writers WHERE contest_id = ? AND user_id = ?")
        .bind(contest_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}
