pub mod audit;
pub mod bg_supervisor;
pub mod clock;
pub mod config;
pub mod error;
pub mod item;
pub mod shutdown;

pub use error::{ErrorKind, ParcelError, ParcelResult, StorageError};
