//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │           Ports (Traits): BackingStore │ CacheNode               │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │               MemoryStore │ LocalNode                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod local_node;
mod memory_store;

pub use local_node::LocalNode;
pub use memory_store::{MemoryStore, Mutation};
