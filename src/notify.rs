use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::models::Submission;

/// Snapshot announced after every submission-level persistence.
#[derive(Debug, Clone)]
pub struct JudgementUpdate {
    pub contest_id: Option<i64>,
    pub submission: Submission,
}

/// Best-effort fan-out of judgement status changes to external consumers
/// (scoreboard, UI). No subscriber, no delivery; a lagging subscriber
/// loses the oldest updates.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<JudgementUpdate>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Notifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JudgementUpdate> {
        self.sender.subscribe()
    }

    pub fn publish(&self, contest_id: Option<i64>, submission: &Submission) {
        let update = JudgementUpdate {
            contest_id,
            submission: submission.clone(),
        };
        if self.sender.send(update).is_err() {
            log::debug!(
                "no subscribers for status update of submission {}",
                submission.id
            );
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(64)
    }
}

/// External contest scoring, invoked only for submissions made inside the
/// contest window by non-writers.
#[async_trait]
pub trait ScoreHook: Send + Sync {
    async fn update_score(&self, submission: &Submission, contest_id: i64);
}

/// Default hook for deployments without a scoreboard wired in.
pub struct LogScoreHook;

#[async_trait]
impl ScoreHook for LogScoreHook {
    async fn update_score(&self, submission: &Submission, contest_id: i64) {
        log::info!(
            "score update: contest {contest_id}, user {}, submission {} -> {} ({} pt)",
            submission.user_id,
            submission.id,
            submission.status,
            submission.point
        );
    }
}
