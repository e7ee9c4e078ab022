use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::judge::{JudgeContext, JudgementJob};
use crate::queue::JudgeQueue;
use crate::sandbox::SandboxFactory;

/// One member of the judging pool: dequeues submission IDs and judges them
/// to completion, one at a time, until shutdown.
pub async fn worker<F>(
    id: u8,
    ctx: Arc<JudgeContext<F>>,
    queue: Arc<JudgeQueue>,
    token: CancellationToken,
) where
    F: SandboxFactory + 'static,
{
    log::info!("worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("worker {id} received shutdown signal, stopping");
                break;
            }

            submission_id = queue.pop() => {
                log::info!("worker {id} picked up submission {submission_id}");

                // A panicking job must not take the worker down with it;
                // the sandbox drop guards handle its leftovers.
                let job_ctx = ctx.clone();
                let handle = tokio::spawn(async move {
                    JudgementJob::run(job_ctx.as_ref(), submission_id).await;
                });

                match handle.await {
                    Ok(()) => log::info!("submission {submission_id} finished on worker {id}"),
                    Err(e) if e.is_panic() => {
                        log::error!("judging submission {submission_id} panicked on worker {id}: {e}");
                    }
                    Err(e) => {
                        log::error!("judging submission {submission_id} aborted on worker {id}: {e}");
                    }
                }
            }
        };
    }

    log::info!("worker {id} has shut down gracefully");
}
