//! Database module for netlog.
//!
//! Provides SQLite storage whose table shape is reconciled additively on
//! every startup instead of through numbered migrations.

mod models;
pub mod schema;
mod store;

pub use models::*;
pub use store::*;
