pub mod lock;
pub mod memory;
pub mod sqlite;

pub use lock::{LocalLockProvider, SqliteLockProvider};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
