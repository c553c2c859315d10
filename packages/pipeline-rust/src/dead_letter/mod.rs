//! Dead-letter capture: records, the storage contract, the in-memory store
//! and its maintenance worker.

pub mod maintenance;
pub mod memory;
pub mod record;
pub mod store;

pub use maintenance::{DeadLetterMaintenance, MaintenanceTask};
pub use memory::InMemoryDeadLetterStore;
pub use record::DeadLetterRecord;
pub use store::{DeadLetterError, DeadLetterQuery, DeadLetterStore};
