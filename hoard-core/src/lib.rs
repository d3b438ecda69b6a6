//! Hoard Core Library
//!
//! Content-addressed storage of files and directories:
//! - Hashing with a persistent fingerprint cache (State)
//! - Object database laid out as `<root>/<oid[..2]>/<oid[2..]>`
//! - Trees: serialized, content-addressed directory listings
//! - Build (workspace -> objects), diff, checkout (objects -> workspace)
//! - Transfer between object databases, status and garbage collection

pub mod error;
pub mod config;
pub mod hash_info;
pub mod meta;
pub mod hash;
pub mod fs;
pub mod odb;
pub mod object;
pub mod tree;
pub mod state;
pub mod ignore;
pub mod build;
pub mod diff;
pub mod checkout;
pub mod status;
pub mod transfer;
pub mod gc;

pub use build::{BuildOptions, Built, build};
pub use checkout::{CheckoutOptions, checkout};
pub use config::{CacheConfig, Config};
pub use diff::{Change, ChangeType, DiffResult, TreeEntry, diff};
pub use error::{Error, Result};
pub use fs::{FileInfo, FileSystem, LinkType, LocalFileSystem, MemoryFileSystem};
pub use gc::gc;
pub use hash::Algorithm;
pub use hash_info::HashInfo;
pub use ignore::{GlobIgnore, Ignore};
pub use meta::Meta;
pub use object::{HashFile, Object};
pub use odb::{AddOptions, ObjectDb, OdbOptions};
pub use state::{SqliteState, StateCache, StateNoop};
pub use status::{CompareStatusResult, StatusResult, compare_status, status};
pub use transfer::{TransferOptions, TransferResult, transfer};
pub use tree::{Tree, du, merge};
