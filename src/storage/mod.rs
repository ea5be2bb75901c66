pub mod audit;
pub mod records;
pub mod registry;

// Re-export common types
pub use audit::{AuditLog, RunStatus};
pub use records::{persist_records, BookRow, PersistRequest, PostgresRecordStore, RecordStore};
pub use registry::fetch_base_url;
