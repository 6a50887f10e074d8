//! Persistence layer: libSQL-backed storage for accounts, message records,
//! label cache and usage accounting.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
