//! Karst — the consensus and replication layer of a replicated database node.
//!
//! Karst binds a generic Raft state machine to the machinery a real node
//! needs around it: a durable write-ahead journal, per-peer replication
//! relays, a synchronous-transaction limbo, and node-local election policy
//! (candidacy modes, quorum tracking, and leader fencing).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Karst                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Node: assembly | recovery | ingest                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Election: mode policy | fencing | worker | term waits      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Raft core: terms | votes | roles      Limbo: sync txns     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Journal: durable WAL        Replication: relays | health   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The Raft core never performs I/O itself: persisting a term record,
//! broadcasting to peers, and deferring slow work all flow through hooks
//! the election layer provides. That keeps the state machine free of
//! suspension points while durability and fan-out stay fully asynchronous.
//!
//! # Quick Start
//!
//! ```no_run
//! use karst::config::KarstConfig;
//! use karst::node::Node;
//!
//! #[tokio::main]
//! async fn main() -> karst::Result<()> {
//!     let config = KarstConfig::development();
//!     let node = Node::start(config).await?;
//!     // ... serve traffic ...
//!     node.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod election;
pub mod events;
pub mod journal;
pub mod limbo;
pub mod node;
pub mod observability;
pub mod raft;
pub mod replication;

// Re-exports
pub use error::{KarstError, Result};
pub use types::*;
