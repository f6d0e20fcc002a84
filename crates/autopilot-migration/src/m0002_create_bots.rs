use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bots::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Bots::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Bots::UserId).uuid().not_null())
                    .col(ColumnDef::new(Bots::FastEngine).string().not_null())
                    .col(ColumnDef::new(Bots::SmartEngine).string().not_null())
                    .col(ColumnDef::new(Bots::FastTokens).integer().not_null())
                    .col(ColumnDef::new(Bots::SmartTokens).integer().not_null())
                    .col(ColumnDef::new(Bots::ImageSize).integer().not_null())
                    .col(ColumnDef::new(Bots::AiSettingsJson).text().not_null())
                    .col(
                        ColumnDef::new(Bots::IsActive)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Bots::IsFailed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Bots::RunsLeft)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Bots::WorkerMessageId).string().null())
                    .col(
                        ColumnDef::new(Bots::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Bots::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    // One bot per user, enforced at the storage layer.
                    .index(
                        Index::create()
                            .name("idx_bots_user_id_unique")
                            .table(Bots::Table)
                            .col(Bots::UserId)
                            .unique(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_bots_user")
                            .from(Bots::Table, Bots::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bots::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Bots {
    Table,
    Id,
    UserId,
    FastEngine,
    SmartEngine,
    FastTokens,
    SmartTokens,
    ImageSize,
    AiSettingsJson,
    IsActive,
    IsFailed,
    RunsLeft,
    WorkerMessageId,
    CreatedAt,
    UpdatedAt,
}
