//! `nodes` crate — the `ActionHandler` trait, the collaborator contracts and
//! the built-in action handlers.
//!
//! Every handler — built-in and connector alike — implements
//! [`ActionHandler`]. The engine's dispatcher routes actions to handlers
//! through this trait object.

pub mod connector;
pub mod error;
pub mod http;
pub mod memory;
pub mod mock;
pub mod record;
pub mod store;
pub mod traits;

pub use error::{ActionError, StoreError};
pub use store::{ConnectionStore, Record, RecordStore, RecordStream};
pub use traits::{ActionContext, ActionHandler, Credentials};
