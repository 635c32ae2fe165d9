use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SagaInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SagaInstances::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SagaInstances::DefinitionId).string().not_null())
                    .col(
                        ColumnDef::new(SagaInstances::Status)
                            .string()
                            .not_null()
                            .default("created"),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::CurrentStepIndex)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SagaInstances::StepResults).text().not_null())
                    .col(ColumnDef::new(SagaInstances::Data).text().not_null())
                    .col(ColumnDef::new(SagaInstances::Error).string().null())
                    .col(
                        ColumnDef::new(SagaInstances::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::StepRetries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::TimeoutAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::TimeoutChecks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SagaInstances::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The timeout scan filters on (status, timeout_at).
        manager
            .create_index(
                Index::create()
                    .name("idx_saga_instances_status_timeout_at")
                    .table(SagaInstances::Table)
                    .col(SagaInstances::Status)
                    .col(SagaInstances::TimeoutAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SagaInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum SagaInstances {
    Table,
    Id,
    DefinitionId,
    Status,
    CurrentStepIndex,
    StepResults,
    Data,
    Error,
    Version,
    StepRetries,
    TimeoutAt,
    TimeoutChecks,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
