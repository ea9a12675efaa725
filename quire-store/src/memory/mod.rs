//! In-memory backends. Nothing survives a restart.

pub mod awareness;
pub mod blob;
pub mod doc;
pub mod history;
pub mod sync;

pub use awareness::{AwarenessRooms, AwarenessStats};
pub use blob::MemoryBlobStorage;
pub use doc::MemoryDocStorage;
pub use history::MemoryHistoryStorage;
pub use sync::MemorySyncStorage;
