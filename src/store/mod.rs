//! Persistence layer: libSQL-backed storage for conversations, drafts,
//! learnings, and guidelines.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
