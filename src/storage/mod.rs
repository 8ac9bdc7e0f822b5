//! File storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where uploaded bytes
//! physically live.  Implementations include local disk and process memory.

pub mod backend;
pub mod disk;
pub mod memory;
