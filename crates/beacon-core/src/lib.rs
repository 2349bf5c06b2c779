pub mod context;
pub mod error;
pub mod storage;

pub use context::ContextManager;
pub use error::{CoreError, Result};
pub use storage::{FileStore, MemoryStore, StateStore};
