//! KOR: Knowledge Object Register
//!
//! A hierarchical, access-controlled, versioned key/value tree shared by a
//! distributed agent network. Each agent owns one subtree of a single
//! global address space; subtrees are synchronized between agents through
//! structural-hash-based incremental diffs, and edited transactionally
//! through staged subtree locks.

pub mod access;
pub mod address;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod repository;
pub mod restriction;
pub mod storage;
pub mod sync;
pub mod tree;
pub mod types;

pub use address::Address;
pub use config::KorConfig;
pub use error::KorError;
pub use repository::KnowledgeRepository;
