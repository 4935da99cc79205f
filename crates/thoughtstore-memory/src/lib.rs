//! Storage backends for thoughtstore.
//!
//! - **SQLite store** ([`SqliteMemory`]): thoughts as parent rows, notes as child
//!   rows, hydrated and written transactionally.
//! - **Mock** ([`MockMemory`]): an in-process test double with identical search
//!   semantics, constructed fresh per test.
//!
//! Both implement `thoughtstore_types::memory::Memory` and share the ranking in
//! [`search`].

pub mod config;
pub mod migration;
pub mod mock;
pub mod search;
pub mod sqlite;

pub use mock::MockMemory;
pub use sqlite::SqliteMemory;
