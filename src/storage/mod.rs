//! Local account store.
//!
//! A single JSON file holding every account, loaded into memory at open and
//! written back atomically (temp file + rename) on seed and on close. The
//! `StorageClient` is the only owner of the file.

pub mod client;

pub use client::{Account, StorageClient, StorageError, SEED_ACCOUNT_COUNT};
