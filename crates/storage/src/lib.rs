pub mod error;
pub mod loader;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod watermark;

pub use error::{LoadError, StoreError, WatermarkError};
pub use loader::{Checkpoint, IdempotentLoader, UnitOfWork, UnitOutcome, UpsertResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{RowOutcome, Store, StoreTx, WatermarkRow};
pub use watermark::{Advance, Position, Stage, Watermark, WatermarkOrdering, WatermarkStore};
