//! Scripted in-memory sandboxes for exercising the judging pipeline
//! without a container runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecResult, ExecStatus, Sandbox, SandboxError, SandboxFactory, INPUT_DIR};

/// Per-case report a fake user program produces for one input file.
pub(crate) struct CaseReport {
    pub stdout: Vec<u8>,
    pub exit_code: i64,
    pub time_s: f64,
    pub memory_kib: u64,
}

impl CaseReport {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        CaseReport {
            stdout: stdout.into(),
            exit_code: 0,
            time_s: 0.05,
            memory_kib: 1024,
        }
    }
}

/// Encodes one batch-runner result block exactly as `judge.sh` frames it.
pub(crate) fn frame_block(stdout: &[u8], exit_code: i64, time_s: f64, memory_kib: u64) -> Vec<u8> {
    let mut out = format!("{} {exit_code} {time_s} {memory_kib}\n", stdout.len()).into_bytes();
    out.extend_from_slice(stdout);
    out.push(b'\n');
    out
}

pub(crate) fn frame_report(report: &CaseReport) -> Vec<u8> {
    frame_block(
        &report.stdout,
        report.exit_code,
        report.time_s,
        report.memory_kib,
    )
}

pub(crate) fn finished(stdout: impl Into<Vec<u8>>) -> ExecResult {
    ExecResult {
        status: ExecStatus::Finished,
        exec_time: Duration::from_millis(80),
        memory_usage: 0,
        stdout: stdout.into(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

pub(crate) fn finished_with_exit(exit_code: i64) -> ExecResult {
    ExecResult {
        exit_code,
        ..finished(Vec::new())
    }
}

type ProgramFn = Box<dyn FnMut(&[u8]) -> CaseReport + Send + Sync>;
type RespondFn = Box<dyn FnMut(&[u8]) -> ExecResult + Send + Sync>;

/// What a scripted sandbox does when run.
pub(crate) enum MockBehavior {
    /// Successive `run` calls pop these results; the last one repeats.
    Runs(Vec<ExecResult>),
    /// Each `run` computes its result from the provided stdin.
    Respond(RespondFn),
    /// Judgement sandbox: apply `program` to every injected input file in
    /// index order and emit framed blocks, at most `blocks_limit` of them.
    Batch {
        program: ProgramFn,
        blocks_limit: Option<usize>,
    },
    /// Refuse creation altogether.
    FailCreate,
}

/// Record of one sandbox creation, for assertions.
pub(crate) struct CreationRecord {
    pub image: String,
    pub cmd: Vec<String>,
    pub judgement: bool,
    destroyed: Arc<AtomicBool>,
}

/// Factory handing out scripted sandboxes in creation order.
#[derive(Default)]
pub(crate) struct MockFactory {
    script: Mutex<Vec<MockBehavior>>,
    pub records: Mutex<Vec<CreationRecord>>,
}

impl MockFactory {
    pub fn new(script: Vec<MockBehavior>) -> Self {
        MockFactory {
            script: Mutex::new(script),
            records: Mutex::new(Vec::new()),
        }
    }

    fn next_behavior(&self) -> MockBehavior {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            MockBehavior::Runs(vec![finished(Vec::new())])
        } else {
            script.remove(0)
        }
    }

    fn make(
        &self,
        image: &str,
        cmd: &[String],
        judgement: bool,
    ) -> Result<MockSandbox, SandboxError> {
        let behavior = self.next_behavior();
        if matches!(behavior, MockBehavior::FailCreate) {
            return Err(SandboxError::Create {
                image: image.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let destroyed = Arc::new(AtomicBool::new(false));
        self.records.lock().unwrap().push(CreationRecord {
            image: image.to_string(),
            cmd: cmd.to_vec(),
            judgement,
            destroyed: destroyed.clone(),
        });
        Ok(MockSandbox {
            behavior,
            files: BTreeMap::new(),
            run_index: 0,
            started: false,
            destroyed,
        })
    }

    /// True when every sandbox this factory handed out has been destroyed.
    pub fn all_destroyed(&self) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.destroyed.load(Ordering::SeqCst))
    }

    pub fn created_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxFactory for MockFactory {
    type Sandbox = MockSandbox;

    async fn create(
        &self,
        image: &str,
        _wall_limit: Duration,
        _memory_limit: u64,
        cmd: &[String],
    ) -> Result<MockSandbox, SandboxError> {
        self.make(image, cmd, false)
    }

    async fn create_judgement(
        &self,
        image: &str,
        _time_limit: Duration,
        _memory_limit: u64,
        cmd: &[String],
        _exe_file_name: &str,
    ) -> Result<MockSandbox, SandboxError> {
        self.make(image, cmd, true)
    }
}

pub(crate) struct MockSandbox {
    behavior: MockBehavior,
    pub files: BTreeMap<String, Vec<u8>>,
    run_index: usize,
    started: bool,
    destroyed: Arc<AtomicBool>,
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn inject_file(&mut self, content: &[u8], path: &str) -> Result<(), SandboxError> {
        if self.started {
            return Err(SandboxError::Io("sandbox has already run".to_string()));
        }
        self.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        Ok(self
            .files
            .get(path)
            .cloned()
            .unwrap_or_else(|| b"\x7fELF-mock".to_vec()))
    }

    async fn run(
        &mut self,
        stdin: &[u8],
        _capture_stdout: bool,
    ) -> Result<ExecResult, SandboxError> {
        self.started = true;
        match &mut self.behavior {
            MockBehavior::Runs(results) => {
                let index = self.run_index.min(results.len().saturating_sub(1));
                self.run_index += 1;
                results
                    .get(index)
                    .cloned()
                    .ok_or_else(|| SandboxError::Run("no scripted result".to_string()))
            }
            MockBehavior::Respond(respond) => Ok(respond(stdin)),
            MockBehavior::Batch {
                program,
                blocks_limit,
            } => {
                let mut indexed: Vec<(usize, Vec<u8>)> = self
                    .files
                    .iter()
                    .filter_map(|(path, content)| {
                        let index = path
                            .strip_prefix(INPUT_DIR)?
                            .strip_suffix(".txt")?
                            .parse()
                            .ok()?;
                        Some((index, content.clone()))
                    })
                    .collect();
                indexed.sort_by_key(|(index, _)| *index);

                let limit = blocks_limit.unwrap_or(usize::MAX);
                let mut stdout = Vec::new();
                for (_, input) in indexed.into_iter().take(limit) {
                    let report = program(&input);
                    stdout.extend_from_slice(&frame_report(&report));
                }
                Ok(finished(stdout))
            }
            MockBehavior::FailCreate => unreachable!("FailCreate rejected at creation"),
        }
    }

    async fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
