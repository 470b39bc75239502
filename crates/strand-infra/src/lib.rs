//! SQLite persistence for the Strand engine.
//!
//! Implements `strand-core`'s [`StateStore`](strand_core::store::StateStore)
//! and [`VectorStore`](strand_core::memory::VectorStore) over a single
//! embedded database file: WAL journal mode, a multi-connection reader pool,
//! a single-connection writer pool, and embedded migrations.

pub mod sqlite;

pub use sqlite::memory::SqliteVectorStore;
pub use sqlite::pool::DatabasePool;
pub use sqlite::state::SqliteStateStore;
