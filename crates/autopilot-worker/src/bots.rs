use autopilot_db::entities::bots;
use autopilot_run::JobHandle;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    prelude::Uuid,
};

use crate::config::Settings;
use crate::queue::{QueueClient, abort_job};
use crate::workspace::{self, AiSettings};

/// Parameters for configuring a new bot.
#[derive(Debug, Clone)]
pub struct BotCreate {
    pub fast_engine: String,
    pub smart_engine: String,
    pub fast_tokens: i32,
    pub smart_tokens: i32,
    pub image_size: i32,
    pub ai_settings: AiSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum BotActionError {
    #[error("bot already exists, wait for it to finish or cancel")]
    AlreadyActive,
    #[error("bot is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub async fn get_bot(db: &DatabaseConnection, user_id: Uuid) -> Result<Option<bots::Model>, sea_orm::DbErr> {
    bots::Entity::find()
        .filter(bots::Column::UserId.eq(user_id))
        .one(db)
        .await
}

/// Enqueue a run for a bot and persist the job handle, claiming the bot's
/// single job slot with a conditional update. If another enqueue won the slot
/// first, the fresh job is aborted and `None` comes back: at most one run per
/// bot is ever queued or in flight, even under a double-submit.
pub async fn enqueue_run(
    db: &DatabaseConnection,
    queue: &QueueClient,
    bot_id: Uuid,
) -> anyhow::Result<Option<JobHandle>> {
    let handle = queue.enqueue(bot_id).await?;

    let claimed = bots::Entity::update_many()
        .col_expr(
            bots::Column::WorkerMessageId,
            Expr::value(handle.0.clone()),
        )
        .col_expr(
            bots::Column::UpdatedAt,
            Expr::value(chrono::Utc::now()),
        )
        .filter(bots::Column::Id.eq(bot_id))
        .filter(bots::Column::WorkerMessageId.is_null())
        .exec(db)
        .await?;

    if claimed.rows_affected == 0 {
        tracing::warn!(bot_id = %bot_id, job = %handle, "job slot already claimed, dropping duplicate run");
        abort_job(queue, &handle.0).await;
        return Ok(None);
    }
    Ok(Some(handle))
}

/// Configure a new bot for a user and launch its first run.
///
/// An active bot blocks creation; an inactive one is replaced. Replacing
/// clears the agent cache and the old log so the new bot starts from a clean
/// record.
pub async fn create_bot(
    settings: &Settings,
    db: &DatabaseConnection,
    queue: &QueueClient,
    user_id: Uuid,
    params: BotCreate,
) -> Result<bots::Model, BotActionError> {
    if let Some(existing) = get_bot(db, user_id).await? {
        if existing.is_active {
            return Err(BotActionError::AlreadyActive);
        }
        bots::Entity::delete_by_id(existing.id).exec(db).await?;
    }

    let ai_settings_json = serde_json::to_string(&params.ai_settings)
        .map_err(|e| anyhow::anyhow!("encode ai settings: {e}"))?;
    let now = chrono::Utc::now();
    let bot = bots::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        fast_engine: Set(params.fast_engine),
        smart_engine: Set(params.smart_engine),
        fast_tokens: Set(params.fast_tokens),
        smart_tokens: Set(params.smart_tokens),
        image_size: Set(params.image_size),
        ai_settings_json: Set(ai_settings_json),
        is_active: Set(true),
        is_failed: Set(false),
        runs_left: Set(1),
        worker_message_id: Set(None),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    }
    .insert(db)
    .await?;

    workspace::clear_workspace_cache(settings, user_id).await;
    workspace::remove_log(settings, user_id).await;

    enqueue_run(db, queue, bot.id).await?;
    Ok(bot)
}

/// Stop a bot: best-effort abort of any in-flight job, then mark it idle.
/// Abort failures are warnings inside the queue bridge; stopping always
/// succeeds from the user's perspective.
pub async fn stop_bot(
    db: &DatabaseConnection,
    queue: &QueueClient,
    bot: &bots::Model,
) -> Result<(), sea_orm::DbErr> {
    if let Some(job_id) = &bot.worker_message_id {
        abort_job(queue, job_id).await;
    }
    bots::ActiveModel {
        id: Set(bot.id),
        is_active: Set(false),
        worker_message_id: Set(None),
        updated_at: Set(chrono::Utc::now().into()),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

/// Grant an idle bot a fresh run budget and enqueue it again.
pub async fn continue_bot(
    db: &DatabaseConnection,
    queue: &QueueClient,
    bot: &bots::Model,
    count: i32,
) -> Result<(), BotActionError> {
    if bot.runs_left > 0 {
        return Err(BotActionError::AlreadyRunning);
    }

    bots::ActiveModel {
        id: Set(bot.id),
        runs_left: Set(count),
        is_active: Set(true),
        updated_at: Set(chrono::Utc::now().into()),
        ..Default::default()
    }
    .update(db)
    .await?;

    enqueue_run(db, queue, bot.id).await?;
    Ok(())
}

/// Worker-restart reconciliation. Handles recorded before a restart point at
/// jobs that no longer exist; clear them, then re-enqueue any bot that was
/// mid-budget so an interrupted run resumes instead of hanging forever.
pub async fn recover_interrupted_bots(
    db: &DatabaseConnection,
    queue: &QueueClient,
) -> anyhow::Result<()> {
    bots::Entity::update_many()
        .col_expr(
            bots::Column::WorkerMessageId,
            Expr::value(Option::<String>::None),
        )
        .filter(bots::Column::WorkerMessageId.is_not_null())
        .exec(db)
        .await?;

    let interrupted = bots::Entity::find()
        .filter(bots::Column::IsActive.eq(true))
        .filter(bots::Column::RunsLeft.gt(0))
        .all(db)
        .await?;
    for bot in interrupted {
        tracing::info!(bot_id = %bot.id, "re-enqueueing interrupted bot");
        enqueue_run(db, queue, bot.id).await?;
    }
    Ok(())
}

/// Delete a bot outright, aborting any in-flight job first.
pub async fn delete_bot(
    db: &DatabaseConnection,
    queue: &QueueClient,
    bot: &bots::Model,
) -> Result<(), sea_orm::DbErr> {
    if let Some(job_id) = &bot.worker_message_id {
        abort_job(queue, job_id).await;
    }
    bots::Entity::delete_by_id(bot.id).exec(db).await?;
    Ok(())
}
