use sea_orm::entity::prelude::*;

/// One configured agent instance. `user_id` carries a unique index so a user
/// can never own more than one bot row.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "bots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub fast_engine: String,
    pub smart_engine: String,
    pub fast_tokens: i32,
    pub smart_tokens: i32,
    pub image_size: i32,
    /// Free-form AI settings blob (goals, name, role, budget), stored as JSON
    /// and re-serialized to YAML for the agent CLI before each spawn.
    pub ai_settings_json: String,
    pub is_active: bool,
    pub is_failed: bool,
    /// Remaining continuation budget. 0 means idle, awaiting a user
    /// "continue" request.
    pub runs_left: i32,
    /// Queue handle of the currently enqueued/running job, if any. Doubles as
    /// the liveness flag: set means exactly one run is in flight or queued.
    pub worker_message_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
