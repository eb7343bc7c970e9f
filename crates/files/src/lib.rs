//! Sharenet file index.
//!
//! The directory keeps a [`MemoryIndexStore`] mapping filenames to the peers
//! sharing them. Peers build their submissions with a [`SharedFolder`] scan.

pub mod scanner;
pub mod store;

pub use scanner::{ScanError, SharedFolder};
pub use store::{IndexStore, IndexStoreError, MemoryIndexStore};
