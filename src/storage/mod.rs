//! Key-value persistence for directory material.
//!
//! The directory subsystem stores consensuses, authority signing certs, and
//! microdescs under flat string keys:
//!
//! - `consensus:<iso-ts>`: one entry per cached consensus, keyed by its
//!   valid-after time
//! - `cert:<fp>`: authority signing certificates by identity fingerprint
//! - `microdesc:<hash>`: microdesc bodies by their SHA-256 ref
//!
//! Two backends ship: an in-memory map and a filesystem directory with
//! mangled file names.

pub mod fs;
pub mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use async_trait::async_trait;
use std::rc::Rc;

/// Async key-value store. One concurrent writer per key is enforced by the
/// caller (the directory caches run keyed single-flight).
#[async_trait(?Send)]
pub trait Storage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn remove_all(&self, prefix: &str) -> Result<()>;
}

pub type SharedStorage = Rc<dyn Storage>;

/// Storage key for a consensus cached by its valid-after time.
pub fn consensus_key(valid_after_iso: &str) -> String {
    format!("consensus:{valid_after_iso}")
}

/// Storage key for an authority signing certificate.
pub fn cert_key(identity_fp: &str) -> String {
    format!("cert:{identity_fp}")
}

/// Storage key for a microdesc body.
pub fn microdesc_key(hash_b64: &str) -> String {
    format!("microdesc:{hash_b64}")
}
