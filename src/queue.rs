use std::collections::VecDeque;

use std::sync::Mutex;
use tokio::sync::Notify;

/// FIFO queue of submission IDs feeding the worker pool.
///
/// Enqueueing never blocks; dequeueing waits until something arrives. No
/// priorities, no retries: a job that dies is finalised by its own cleanup,
/// not requeued.
#[derive(Default)]
pub struct JudgeQueue {
    queue: Mutex<VecDeque<i64>>,
    notify: Notify,
}

impl JudgeQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, submission_id: i64) {
        self.queue.lock().unwrap().push_back(submission_id);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> i64 {
        loop {
            if let Some(submission_id) = self.queue.lock().unwrap().pop_front() {
                return submission_id;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
