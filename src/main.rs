use std::process::Command;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use koneko_judge::config::{CliArgs, Config};
use koneko_judge::database as db;
use koneko_judge::judge::JudgeContext;
use koneko_judge::notify::{LogScoreHook, Notifier};
use koneko_judge::queue::JudgeQueue;
use koneko_judge::sandbox::DockerFactory;
use koneko_judge::worker::worker;

/// Check if a command exists in the system PATH
fn check_command_exists(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check if the current user is root and warn if so
fn check_running_user() {
    if std::env::var("USER").unwrap_or_default() == "root"
        || std::env::var("LOGNAME").unwrap_or_default() == "root"
        || unsafe { libc::getuid() } == 0
    {
        log::warn!("WARNING: Running as root user is not recommended for security reasons!");
        log::warn!("Please consider running this application with a non-privileged user account.");
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(log_level));

    if !check_command_exists("docker") {
        log::error!("Required command 'docker' not found. Sandboxes cannot be created.");
        std::process::exit(1);
    }

    check_running_user();

    let Config {
        workers: n_workers,
        image_name_prefix,
        judge_script,
        database_path,
    } = cli.read_config().unwrap_or_else(|e| {
        log::error!("Failed to read configuration: {e}");
        std::process::exit(1);
    });

    if n_workers == 0 {
        log::error!("The number of workers must not be 0");
        std::process::exit(1);
    }
    if !judge_script.is_file() {
        log::error!(
            "Batch-runner script not found at {}",
            judge_script.display()
        );
        std::process::exit(1);
    }

    let db_path = database_path.unwrap_or_else(db::get_db_path);
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path).await.unwrap_or_else(|e| {
        log::error!("Failed to initialize database: {e}");
        std::process::exit(1);
    });

    let ctx = Arc::new(JudgeContext {
        db: db_pool,
        factory: DockerFactory,
        notifier: Notifier::default(),
        score_hook: Arc::new(LogScoreHook),
        image_prefix: image_name_prefix,
        judge_script,
    });
    let job_queue = Arc::new(JudgeQueue::new());
    let shutdown_token = CancellationToken::new();

    // Submissions accepted before a restart are still waiting; requeue them.
    match db::waiting_submission_ids(&ctx.db).await {
        Ok(ids) => {
            if !ids.is_empty() {
                log::info!("requeueing {} waiting submissions", ids.len());
            }
            for id in ids {
                job_queue.push(id);
            }
        }
        Err(e) => log::error!("Failed to scan for waiting submissions: {e}"),
    }

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=n_workers {
        workers.spawn(worker(
            i,
            ctx.clone(),
            job_queue.clone(),
            shutdown_token.clone(),
        ));
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {res_worker:?}");
        }
    }

    // 1. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 2. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {e:?}");
            } else {
                log::error!("Worker handle finished with error: {e:?}");
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
