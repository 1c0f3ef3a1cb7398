pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStore, DEFAULT_LOCK_TIMEOUT};
pub use record::{
    ConfirmationCodeRecord, GeoPoint, LocationSampleRecord, StatusHistoryRecord, TicketRecord,
    TimeLogRecord,
};
pub use traits::TicketStore;
