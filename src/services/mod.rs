pub mod bookings;
pub mod catalog;
pub mod expiry;
pub mod inventory_sync;

pub use bookings::BookingService;
pub use catalog::CatalogService;
pub use expiry::ExpiryWorker;
pub use inventory_sync::InventorySyncService;
