//! ferry-core: shared data model, configuration schema, and error taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use error::{FerryError, FerryResult};
pub use types::{
    ConflictPolicy, EntryType, FileEntry, LocationMeta, StorageKind, StorageLocation, TransferRef,
};
