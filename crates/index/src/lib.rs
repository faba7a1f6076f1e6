pub mod error;
pub mod storage;
pub mod store;

pub use error::IndexError;
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use store::{IndexEntry, IndexStore};
