use sea_orm_migration::prelude::*;

/// Catalog tables owned by the ticket service. Created here so local
/// development and the test suite have the full schema; production points
/// at the catalog service's own database.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Events::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Events::Id).uuid().primary_key().not_null())
                    .col(ColumnDef::new(Events::Name).string().not_null())
                    .col(
                        ColumnDef::new(Events::MaxPerUser)
                            .integer()
                            .not_null()
                            .default(4),
                    )
                    .col(
                        ColumnDef::new(Events::QueueEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Events::TenantId).uuid().null())
                    .col(
                        ColumnDef::new(Events::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Shows::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Shows::Id).uuid().primary_key().not_null())
                    .col(ColumnDef::new(Shows::EventId).uuid().not_null())
                    .col(
                        ColumnDef::new(Shows::StartsAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Shows::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SeatZones::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SeatZones::Id).uuid().primary_key().not_null())
                    .col(ColumnDef::new(SeatZones::EventId).uuid().not_null())
                    .col(ColumnDef::new(SeatZones::ShowId).uuid().not_null())
                    .col(ColumnDef::new(SeatZones::Name).string().not_null())
                    .col(ColumnDef::new(SeatZones::Capacity).integer().not_null())
                    .col(ColumnDef::new(SeatZones::UnitPrice).decimal().not_null())
                    .col(
                        ColumnDef::new(SeatZones::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_seat_zones_event_id")
                    .table(SeatZones::Table)
                    .col(SeatZones::EventId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SeatZones::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Shows::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Events::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Events {
    Table,
    Id,
    Name,
    MaxPerUser,
    QueueEnabled,
    TenantId,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum Shows {
    Table,
    Id,
    EventId,
    StartsAt,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum SeatZones {
    Table,
    Id,
    EventId,
    ShowId,
    Name,
    Capacity,
    UnitPrice,
    CreatedAt,
}
