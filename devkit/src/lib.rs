/*!
# backtestd DevKit - Stubs and Utilities for Development

Stand-ins for the plugin's two external collaborators, so it can be
developed and tested without a broker or a storage backend:
- Core-link stub for lifecycle tests without MQTT
- In-memory and always-failing checkpoint stores
*/

pub mod store_stub;
pub mod supervisor_stub;

pub use store_stub::{FailingCheckpointStore, MemoryCheckpointStore};
pub use supervisor_stub::StubSupervisor;
