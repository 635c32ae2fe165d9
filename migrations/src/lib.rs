pub use sea_orm_migration::prelude::*;

mod m20250410_000001_create_bookings_table;
mod m20250410_000002_create_saga_instances_table;
mod m20250410_000003_create_outbox_events_table;
mod m20250410_000004_create_payments_table;
mod m20250410_000005_create_zone_inventory_table;
mod m20250410_000006_create_catalog_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250410_000001_create_bookings_table::Migration),
            Box::new(m20250410_000002_create_saga_instances_table::Migration),
            Box::new(m20250410_000003_create_outbox_events_table::Migration),
            Box::new(m20250410_000004_create_payments_table::Migration),
            Box::new(m20250410_000005_create_zone_inventory_table::Migration),
            Box::new(m20250410_000006_create_catalog_tables::Migration),
        ]
    }
}
