//! A persistent heap allocator over memory-mapped files.
//!
//! Turns a directory on disk into a durable, mappable arena: a process
//! opens a [`manager::Manager`] datastore, receives a stable base address,
//! allocates objects that hold only position-independent offsets relative
//! to that base ([`offset_ptr::OffsetPtr`]), and persists everything on
//! sync/close. Reopening restores every byte and every internal pointer,
//! possibly at a different base address.
//!
//! Layout mirrors the subsystem split described in the design docs: a
//! bin-number manager and multilayer bitset underpin a chunk/bin-directory
//! pair that a per-CPU object cache fronts; a segment allocator ties those
//! together over file-backed segment storage; three object directories
//! (named/unique/anonymous) and the storage/metadata layer round out the
//! public `Manager` kernel.

pub mod bin_directory;
pub mod bin_manager;
pub mod bitset;
pub mod chunk_directory;
pub mod config;
pub mod error;
pub mod manager;
pub mod object_cache;
pub mod object_directory;
pub mod offset_ptr;
pub mod os;
pub mod segment_allocator;
pub mod segment_storage;
pub mod storage;

pub use error::{Error, Result};
pub use manager::{InPlaceConstructor, Manager};
pub use offset_ptr::{Offset, OffsetPtr, NULL_OFFSET};
