use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bookings::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Bookings::Id).uuid().primary_key().not_null())
                    .col(
                        ColumnDef::new(Bookings::ReservationId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Bookings::UserId).uuid().not_null())
                    .col(ColumnDef::new(Bookings::EventId).uuid().not_null())
                    .col(ColumnDef::new(Bookings::ShowId).uuid().not_null())
                    .col(ColumnDef::new(Bookings::ZoneId).uuid().not_null())
                    .col(ColumnDef::new(Bookings::Quantity).integer().not_null())
                    .col(ColumnDef::new(Bookings::UnitPrice).decimal().not_null())
                    .col(ColumnDef::new(Bookings::TotalAmount).decimal().not_null())
                    .col(
                        ColumnDef::new(Bookings::Status)
                            .string()
                            .not_null()
                            .default("reserved"),
                    )
                    .col(
                        ColumnDef::new(Bookings::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Bookings::ConfirmedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Bookings::PaymentId).string().null())
                    .col(
                        ColumnDef::new(Bookings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Bookings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The expiry scan filters on (status, expires_at).
        manager
            .create_index(
                Index::create()
                    .name("idx_bookings_status_expires_at")
                    .table(Bookings::Table)
                    .col(Bookings::Status)
                    .col(Bookings::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bookings_user_id")
                    .table(Bookings::Table)
                    .col(Bookings::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bookings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Bookings {
    Table,
    Id,
    ReservationId,
    UserId,
    EventId,
    ShowId,
    ZoneId,
    Quantity,
    UnitPrice,
    TotalAmount,
    Status,
    ExpiresAt,
    ConfirmedAt,
    PaymentId,
    CreatedAt,
    UpdatedAt,
}
