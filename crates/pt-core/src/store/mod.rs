//! Persistent store
//!
//! Every (namespace, application) owns one small SQLite database holding a
//! key-value table. The application profile document lives under a single
//! key of that table.

mod kv;
mod profile_store;

pub use kv::{AppDb, Kv};
pub use profile_store::ProfileStore;

/// File name of each application's database
pub const DB_FILE_NAME: &str = "profile.db";

/// Directory under the data root holding the per-namespace trees
pub const NAMESPACES_DIR: &str = "ns";
