//! Filesystem storage backend.
//!
//! Keys map to file names in a single directory. ASCII alphanumerics pass
//! through; every other codepoint is escaped as `_XX_` (two hex digits for
//! code points up to 0xFF) or `_XXXX_` (four digits for the rest), so keys
//! like `consensus:2026-08-01T00:00:00` stay portable across filesystems.
//! The mapping is reversible, which `list` relies on.

use super::Storage;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TorError::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(mangle_key(key))
    }
}

/// Encode a key as a safe file name.
pub fn mangle_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            let code = ch as u32;
            if code <= 0xFF {
                out.push_str(&format!("_{code:02x}_"));
            } else {
                out.push_str(&format!("_{code:04x}_"));
            }
        }
    }
    out
}

/// Invert [`mangle_key`]. Returns `None` for file names this backend did
/// not produce.
pub fn unmangle_key(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '_' {
            if !ch.is_ascii_alphanumeric() {
                return None;
            }
            out.push(ch);
            continue;
        }
        let mut hex = String::new();
        loop {
            match chars.next() {
                Some('_') => break,
                Some(d) if d.is_ascii_hexdigit() => hex.push(d),
                _ => return None,
            }
        }
        if hex.len() != 2 && hex.len() != 4 {
            return None;
        }
        let code = u32::from_str_radix(&hex, 16).ok()?;
        out.push(char::from_u32(code)?);
    }
    Some(out)
}

#[async_trait(?Send)]
impl Storage for FsStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TorError::Storage(format!("read {key}: {e}"))),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        std::fs::write(self.path_for(key), value)
            .map_err(|e| TorError::Storage(format!("write {key}: {e}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| TorError::Storage(format!("list {}: {e}", self.dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| TorError::Storage(format!("list entry: {e}")))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = unmangle_key(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TorError::Storage(format!("remove {key}: {e}"))),
        }
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        for key in self.list(prefix).await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}
