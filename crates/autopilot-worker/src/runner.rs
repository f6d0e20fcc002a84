use std::sync::Arc;

use autopilot_db::entities::{bots, users};
use autopilot_run::{JobHandle, RunOutcome};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use tokio::io::AsyncRead;

use crate::bots as bot_actions;
use crate::config::Settings;
use crate::credentials::{AuthBackendClient, resolve_openai_key};
use crate::line_reader::LineReader;
use crate::log_file::LogAppender;
use crate::log_tail;
use crate::process::build_agent_command;
use crate::queue::{QueueClient, RunRequest};
use crate::workspace;

/// Everything one run needs, constructed once at worker startup and shared by
/// all jobs in the pool.
pub struct WorkerCtx {
    pub settings: Settings,
    pub db: Arc<DatabaseConnection>,
    pub auth: AuthBackendClient,
    pub queue: Arc<QueueClient>,
}

/// Reasons a run fails before the agent process can produce an exit code.
/// Both surface exactly like a non-zero exit: persisted failure state and a
/// line at the end of the log, never an error to the queue.
#[derive(Debug, thiserror::Error)]
enum RunFailure {
    #[error("credential resolution failed: {0}")]
    Credentials(anyhow::Error),
    #[error("failed to launch agent: {0}")]
    Spawn(anyhow::Error),
}

/// The last two lines the stream reader emitted, kept for shutdown-marker
/// detection after the process exits.
#[derive(Debug, Default)]
pub(crate) struct StreamTail {
    pub last: Option<String>,
    pub second_to_last: Option<String>,
}

/// Drain agent output into the log until end-of-stream. Whatever was flushed
/// before a mid-stream death is retained; read or write errors end the drain
/// but never the run, which is classified by the exit code afterwards.
pub(crate) async fn drain_to_log<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    log: &mut LogAppender,
) -> StreamTail {
    let mut tail = StreamTail::default();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = log.append(&line).await {
                    tracing::warn!(path = %log.path().display(), error = %e, "failed to append to run log");
                }
                tail.second_to_last = tail.last.take();
                tail.last = Some(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading agent output");
                break;
            }
        }
    }
    tail
}

/// Entry point the queue invokes for each run. Fire-and-forget: completion is
/// observable only through the persisted bot fields and the growing log.
pub async fn run_bot(ctx: Arc<WorkerCtx>, req: RunRequest) {
    if let Err(e) = run_bot_inner(&ctx, &req).await {
        tracing::error!(bot_id = %req.bot_id, job = %req.handle, error = %e, "bot run aborted");
    }
}

async fn run_bot_inner(ctx: &WorkerCtx, req: &RunRequest) -> anyhow::Result<()> {
    let db = ctx.db.as_ref();

    // FETCH. A missing bot or user means a delete raced the queued job;
    // nothing to update, so bail without touching state.
    let Some(bot) = bots::Entity::find_by_id(req.bot_id).one(db).await? else {
        tracing::warn!(bot_id = %req.bot_id, "bot disappeared before its run started");
        return Ok(());
    };
    let Some(user) = users::Entity::find_by_id(bot.user_id).one(db).await? else {
        tracing::warn!(bot_id = %bot.id, user_id = %bot.user_id, "bot owner disappeared before run");
        return Ok(());
    };

    let log_path = workspace::log_path(&ctx.settings, bot.user_id);
    let mut log = LogAppender::open(&log_path).await?;

    // RESOLVE_CREDENTIALS.
    let openai_key = match resolve_openai_key(&ctx.settings, &ctx.auth, &user.username).await {
        Ok(key) => key,
        Err(e) => {
            return persist_failure(ctx, &bot, &mut log, RunFailure::Credentials(e)).await;
        }
    };

    // SPAWN. Settings files are materialized as a side effect of building
    // the command, before the process exists.
    let command = match build_agent_command(&ctx.settings, &bot, &openai_key).await {
        Ok(cmd) => cmd,
        Err(e) => return persist_failure(ctx, &bot, &mut log, RunFailure::Spawn(e)).await,
    };
    let mut proc = match command.spawn() {
        Ok(p) => p,
        Err(e) => return persist_failure(ctx, &bot, &mut log, RunFailure::Spawn(e)).await,
    };
    tracing::info!(bot_id = %bot.id, pid = ?proc.id(), job = %req.handle, "agent run started");

    // STREAM. Stdout and stderr arrive merged on one pipe.
    let tail = drain_to_log(&mut proc.output, &mut log).await;
    let status = proc.wait().await?;
    let exit_code = status.code();

    // CLASSIFY.
    let outcome = autopilot_run::classify(
        exit_code,
        tail.second_to_last.as_deref(),
        &ctx.settings.shutdown_marker,
    );
    if outcome == RunOutcome::Failed {
        tracing::warn!(bot_id = %bot.id, code = ?exit_code, "bot exited with non-zero return code");
        if let Ok(tail_lines) = log_tail::tail_log(&log_path, 5).await {
            tracing::warn!(bot_id = %bot.id, tail = ?tail_lines, "last log lines of failed run");
        }
    }

    persist_outcome(db, &ctx.queue, &bot, outcome).await?;
    Ok(())
}

/// PERSIST + RE-ENQUEUE. Each outcome writes exactly one bot update, so a
/// crash in between leaves a well-defined last-persisted state. Returns the
/// new job handle when a follow-up run was enqueued.
pub(crate) async fn persist_outcome(
    db: &DatabaseConnection,
    queue: &QueueClient,
    bot: &bots::Model,
    outcome: RunOutcome,
) -> anyhow::Result<Option<JobHandle>> {
    match outcome {
        RunOutcome::Failed => {
            bots::ActiveModel {
                id: Set(bot.id),
                is_failed: Set(true),
                is_active: Set(false),
                runs_left: Set(0),
                worker_message_id: Set(None),
                updated_at: Set(chrono::Utc::now().into()),
                ..Default::default()
            }
            .update(db)
            .await?;
            Ok(None)
        }
        RunOutcome::Finished => {
            tracing::info!(bot_id = %bot.id, "bot finished");
            bots::ActiveModel {
                id: Set(bot.id),
                is_active: Set(false),
                runs_left: Set(0),
                worker_message_id: Set(None),
                updated_at: Set(chrono::Utc::now().into()),
                ..Default::default()
            }
            .update(db)
            .await?;
            Ok(None)
        }
        RunOutcome::Continuable => {
            bots::ActiveModel {
                id: Set(bot.id),
                runs_left: Set(bot.runs_left - 1),
                worker_message_id: Set(None),
                updated_at: Set(chrono::Utc::now().into()),
                ..Default::default()
            }
            .update(db)
            .await?;

            // Re-enqueue only while budget remains after the decrement.
            if bot.runs_left > 1 {
                bot_actions::enqueue_run(db, queue, bot.id).await
            } else {
                tracing::info!(bot_id = %bot.id, "run budget exhausted, bot idle");
                Ok(None)
            }
        }
    }
}

/// Terminal persist for runs that died before or at spawn: the failure reason
/// goes to the tail of the log, the bot record gets the failed state, and the
/// queue sees a successfully completed job.
async fn persist_failure(
    ctx: &WorkerCtx,
    bot: &bots::Model,
    log: &mut LogAppender,
    failure: RunFailure,
) -> anyhow::Result<()> {
    tracing::warn!(bot_id = %bot.id, error = %failure, "bot run failed before the agent produced output");
    let _ = log.append(&format!("{failure}\n")).await;

    persist_outcome(ctx.db.as_ref(), &ctx.queue, bot, RunOutcome::Failed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn temp_log() -> PathBuf {
        std::env::temp_dir().join(format!("autopilot-runner-{}.log", uuid::Uuid::new_v4()))
    }

    fn test_bot(runs_left: i32) -> bots::Model {
        bots::Model {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            fast_engine: "gpt-3.5-turbo".to_string(),
            smart_engine: "gpt-4".to_string(),
            fast_tokens: 4000,
            smart_tokens: 8000,
            image_size: 512,
            ai_settings_json: "{}".to_string(),
            is_active: true,
            is_failed: false,
            runs_left,
            worker_message_id: None,
            created_at: chrono::Utc::now().into(),
            updated_at: chrono::Utc::now().into(),
        }
    }

    fn noop_queue() -> QueueClient {
        let queue = QueueClient::new(1);
        queue.start(Arc::new(|_req| Box::pin(async {})));
        queue
    }

    #[tokio::test]
    async fn drain_retains_last_two_emitted_lines() {
        let path = temp_log();
        let mut log = LogAppender::open(&path).await.unwrap();
        let bytes: &[u8] = b"step one\nShutting down...\nbye\n";
        let mut reader = LineReader::new(bytes);

        let tail = drain_to_log(&mut reader, &mut log).await;

        assert_eq!(tail.second_to_last.as_deref(), Some("Shutting down...\n"));
        assert_eq!(tail.last.as_deref(), Some("bye\n"));

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "step one\nShutting down...\nbye\n");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn drain_collapses_progress_redraws_in_the_log() {
        let path = temp_log();
        let mut log = LogAppender::open(&path).await.unwrap();
        let bytes: &[u8] = b"10%\r20%\r30%\rdone\n";
        let mut reader = LineReader::new(bytes);

        let tail = drain_to_log(&mut reader, &mut log).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "10%\rdone\n");
        assert_eq!(tail.second_to_last.as_deref(), Some("10%\r"));
        assert_eq!(tail.last.as_deref(), Some("done\n"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn drain_of_empty_stream_leaves_no_tail() {
        let path = temp_log();
        let mut log = LogAppender::open(&path).await.unwrap();
        let bytes: &[u8] = b"";
        let mut reader = LineReader::new(bytes);

        let tail = drain_to_log(&mut reader, &mut log).await;
        assert!(tail.last.is_none());
        assert!(tail.second_to_last.is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_log_keeps_agent_stderr_on_clean_exit() {
        use crate::process::AgentCommand;

        let path = temp_log();
        let mut log = LogAppender::open(&path).await.unwrap();
        let cmd = AgentCommand {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "printf 'step done\\n'; printf 'agent log line\\n' >&2; exit 0".to_string(),
            ],
            env: std::collections::BTreeMap::new(),
        };

        let mut proc = cmd.spawn().unwrap();
        drain_to_log(&mut proc.output, &mut log).await;
        let status = proc.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));

        // The agent logs to stderr; a clean run must still retain that
        // output in the log.
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("step done\n"));
        assert!(content.contains("agent log line\n"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn failed_outcome_persists_terminal_failure() {
        let bot = test_bot(3);
        let updated = bots::Model {
            is_failed: true,
            is_active: false,
            runs_left: 0,
            ..bot.clone()
        };
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[updated]])
            .into_connection();
        let queue = noop_queue();

        let handle = persist_outcome(&db, &queue, &bot, RunOutcome::Failed)
            .await
            .unwrap();
        assert!(handle.is_none());

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
        let update = format!("{:?}", log[0]);
        assert!(update.contains("is_failed"));
        assert!(update.contains("runs_left"));
    }

    #[tokio::test]
    async fn finished_outcome_leaves_bot_idle() {
        let bot = test_bot(1);
        let updated = bots::Model {
            is_active: false,
            runs_left: 0,
            ..bot.clone()
        };
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[updated]])
            .into_connection();
        let queue = noop_queue();

        let handle = persist_outcome(&db, &queue, &bot, RunOutcome::Finished)
            .await
            .unwrap();
        assert!(handle.is_none());

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
        let update = format!("{:?}", log[0]);
        assert!(update.contains("is_active"));
        assert!(!update.contains("is_failed"));
    }

    #[tokio::test]
    async fn continuable_run_decrements_budget_and_reenqueues() {
        let bot = test_bot(3);
        let updated = bots::Model {
            runs_left: 2,
            ..bot.clone()
        };
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[updated]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let queue = noop_queue();

        let handle = persist_outcome(&db, &queue, &bot, RunOutcome::Continuable)
            .await
            .unwrap();
        assert!(handle.is_some());

        let log = db.into_transaction_log();
        // Budget decrement, then the conditional job-slot claim.
        assert_eq!(log.len(), 2);
        let update = format!("{:?}", log[0]);
        assert!(update.contains("runs_left"));
        let claim = format!("{:?}", log[1]);
        assert!(claim.contains("worker_message_id"));
    }

    #[tokio::test]
    async fn exhausted_budget_is_not_reenqueued() {
        let bot = test_bot(1);
        let updated = bots::Model {
            runs_left: 0,
            ..bot.clone()
        };
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[updated]])
            .into_connection();
        let queue = noop_queue();

        let handle = persist_outcome(&db, &queue, &bot, RunOutcome::Continuable)
            .await
            .unwrap();
        assert!(handle.is_none());

        // A single update, no job-slot claim.
        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
    }
}
