//! SQLite persistence for featmgr.
//!
//! [`SqliteHive`] stores the boot-store key tree and [`SqliteFeatureKernel`]
//! emulates the kernel's feature configuration state. Both can share one
//! database file; each opens its own connection and migrates the schema on
//! open.

mod hive;
mod kernel;
mod schema;

pub use hive::SqliteHive;
pub use kernel::SqliteFeatureKernel;
pub use schema::{current_schema_version, migrate, open_connection, LATEST_SCHEMA_VERSION};
