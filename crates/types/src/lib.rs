//! Shared data model for the Sharenet directory and peers.
//!
//! Everything that crosses a process boundary lives here: peer identifiers,
//! file metadata records and the JSON messages exchanged with the directory.

pub mod address;
pub mod file_record;
pub mod wire;

pub use address::*;
pub use file_record::*;
pub use wire::*;
