//! ferry-storage: confined local filesystem access + OpenDAL object storage

pub mod health;
pub mod local;
pub mod object;
pub mod operator;
pub mod validator;

pub use health::check_health;
pub use local::LocalFileOps;
pub use object::{ByteStream, ObjectHead, ObjectPage, ObjectReader, ObjectStore, OpendalObjectStore};
pub use operator::{build_operator, ObjectStoreConfig};
pub use validator::PathValidator;
