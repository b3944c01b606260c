//! In-process doubles for the signaling store and media stack.
//!
//! Enabled for unit tests and, through the `testing` feature, for
//! downstream integration tests.

mod memory_store;
mod mock_media;

pub use memory_store::MemoryStore;
pub use mock_media::{MockMediaBackend, MockPeer, Published, RecordingPublisher};
