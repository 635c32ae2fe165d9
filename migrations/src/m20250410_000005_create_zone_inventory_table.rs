use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ZoneInventory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ZoneInventory::ZoneId)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ZoneInventory::EventId).uuid().not_null())
                    .col(
                        ColumnDef::new(ZoneInventory::TotalCapacity)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ZoneInventory::Available).integer().not_null())
                    .col(
                        ColumnDef::new(ZoneInventory::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_zone_inventory_event_id")
                    .table(ZoneInventory::Table)
                    .col(ZoneInventory::EventId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ZoneInventory::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum ZoneInventory {
    Table,
    ZoneId,
    EventId,
    TotalCapacity,
    Available,
    UpdatedAt,
}
