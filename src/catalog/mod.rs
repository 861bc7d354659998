//! The slice of the show catalog the core depends on: existence checks.

mod schema;
mod show_store;

pub use show_store::{ShowCatalog, SqliteShowCatalog};
