//! Page storage: slotted pages, latching, shadow-paged atomic writes and
//! durability backends.

pub mod backend;
pub mod page;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, PageBackend};
pub use page::Page;
pub use store::{ExtensionGuard, LockMode, PageHandle, PageStore, Slot, Txn};
