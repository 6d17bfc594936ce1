//! DocSync Core - replicated tree-document sync engine
//!
//! Keeps every replica of a tree-shaped rich-text document convergent by
//! routing all changes through a single ordered log. It implements:
//! - Stable cross-replica node identities
//! - Change capture from host mutation batches
//! - Word-level splitting of text nodes
//! - Batching, flattening and per-replica undo/redo
//! - Log ordering, desync detection and snapshot persistence
//! - Remote caret presence
//! - Broker-relayed and peer-mesh transports (feature `session`)
//!
//! # Examples
//!
//! ```rust
//! use docsync_core::{MemoryTree, Replica, SyncConfig};
//!
//! let mut replica = Replica::new("client-1", MemoryTree::new(), SyncConfig::default());
//! replica.edit(|tree| {
//!     let p = tree.append_paragraph().unwrap();
//!     tree.append_text(p, "hello world").unwrap();
//! });
//!
//! assert_eq!(replica.text(), "hello world");
//! assert!(replica.has_pending());
//! ```

pub mod applier;
pub mod batcher;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod ids;
pub mod log;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod splitter;
pub mod tree;

#[cfg(feature = "session")]
pub mod session;
#[cfg(feature = "session")]
pub mod transport;

// Re-exports for convenience
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use ids::{SequenceId, SyncId};
pub use operation::{Operation, OperationKind};
pub use replica::{Replica, ReplicaEvent};
pub use tree::{HostTree, MemoryTree, SerializedDocument, SerializedNode};

/// Replica (author) identifier type
pub type AuthorId = String;

/// Document identifier type
pub type DocumentId = String;
