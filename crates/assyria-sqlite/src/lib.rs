//! SQLite store adapter for Assyria.
//!
// FFI calls into libsqlite3 require unsafe code
#![allow(unsafe_code)]
//!
//! `SqliteStore` implements `StoreAdapter` from assyria-core over a single
//! embedded SQLite connection. SQLite is compiled from the bundled
//! amalgamation, so no system library is needed.
//!
//! # Example
//!
//! ```rust,ignore
//! use assyria_sqlite::{SqliteConfig, SqliteStore};
//! use assyria_core::{StoreAdapter, Value};
//!
//! let store = SqliteStore::open(&SqliteConfig::file("app.db"))?
//!     .with_observer(|sql| println!("{sql}"));
//! store.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)")?;
//! let outcome = store.insert("users", &["name"], &[Value::from("Zhu")])?;
//! assert_eq!(outcome.generated_key, 1);
//! ```
//!
//! # Type Mapping
//!
//! | `Value` | SQLite storage class |
//! |---------|----------------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER (read back as `BigInt`) |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Uuid` | BLOB (16 bytes, read back as `Bytes`) |
//! | `Null` | NULL |

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteRows, SqliteStore};

/// SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
