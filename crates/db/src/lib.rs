//! `db` crate — pure persistence layer.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! every table in the automation schema, and the Postgres implementation of
//! the Record Store collaborator. No business logic lives here.

pub mod error;
pub mod models;
pub mod pool;
pub mod record_store;
pub mod repository;

pub use error::DbError;
pub use pool::DbPool;
pub use record_store::PgRecordStore;
