//! `rotor-store` — document storage boundary for the rotor scheduler.
//!
//! # Overview
//!
//! Schedulable entities are stored as JSON documents keyed by id. Queries are
//! expressed as a composable [`Filter`] tree and executed by a
//! [`StorageProvider`] implementation. Two providers ship with the crate:
//!
//! | Provider           | Backing                                            |
//! |--------------------|----------------------------------------------------|
//! | [`MemoryProvider`] | In-process `DashMap`, for embedding and tests         |
//! | [`SqliteProvider`] | SQLite document table queried via the JSON1 functions |
//!
//! The one coordination primitive the scheduler relies on is
//! [`StorageProvider::conditional_update`]: set a field to a new value if and
//! only if it still holds the value the caller last read. Both providers
//! implement it as a single atomic operation.

pub mod document;
pub mod error;
pub mod filter;
pub mod memory;
pub mod provider;
pub mod sqlite;

pub use document::Document;
pub use error::{Result, StoreError};
pub use filter::Filter;
pub use memory::MemoryProvider;
pub use provider::StorageProvider;
pub use sqlite::SqliteProvider;
