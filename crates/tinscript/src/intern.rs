//! The interned, refcounted string table.
//!
//! Every string the runtime touches lives here, keyed by its 32-bit name
//! hash. String-typed variables store only the hash; reading one resolves
//! the bytes through this table. Entries are refcounted: bytecode constants
//! and string-typed variable slots hold references, and entries that reach
//! zero references are reclaimed at statement boundaries.
//!
//! The language's identity of strings relies on hash uniqueness, so a
//! collision (same hash, different bytes) is a fatal error, not a slot
//! chain.

use std::fmt::Write as _;
use std::path::Path;

use ahash::AHashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::hash::hash_string;

/// One interned string and its reference count.
#[derive(Debug, Clone)]
struct StringEntry {
    refcount: u32,
    text: String,
}

/// Dictionary from 32-bit hash to refcounted bytes.
///
/// Owned by the `ScriptContext`; never shared between contexts.
#[derive(Debug, Default)]
pub struct StringTable {
    entries: AHashMap<u32, StringEntry>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its hash and taking a reference:
    /// a new string starts at one reference, and re-adding bumps the
    /// count. Detects hash collisions.
    pub fn add(&mut self, s: &str) -> ScriptResult<u32> {
        if s.is_empty() {
            return Ok(0);
        }
        let hash = hash_string(s);
        if let Some(entry) = self.entries.get_mut(&hash) {
            if entry.text != s {
                return Err(ScriptError::internal(format!(
                    "string table collision: \"{}\" and \"{s}\" both hash to 0x{hash:08x}",
                    entry.text
                )));
            }
            entry.refcount += 1;
            return Ok(hash);
        }
        self.entries.insert(
            hash,
            StringEntry {
                refcount: 1,
                text: s.to_owned(),
            },
        );
        Ok(hash)
    }

    /// Looks up the bytes for a hash.
    #[must_use]
    pub fn get(&self, hash: u32) -> Option<&str> {
        if hash == 0 {
            return Some("");
        }
        self.entries.get(&hash).map(|e| e.text.as_str())
    }

    /// Best-effort reverse lookup for diagnostics: the interned bytes if the
    /// hash has been seen, else a `<hash:0x........>` placeholder.
    #[must_use]
    pub fn unhash(&self, hash: u32) -> String {
        match self.get(hash) {
            Some(s) if !s.is_empty() => s.to_owned(),
            Some(_) => String::new(),
            None => format!("<hash:0x{hash:08x}>"),
        }
    }

    /// Takes a reference to an entry. Unknown hashes are ignored.
    pub fn increment(&mut self, hash: u32) {
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.refcount += 1;
        }
    }

    /// Releases a reference to an entry. Unknown hashes are ignored; the
    /// count saturates at zero.
    pub fn decrement(&mut self, hash: u32) {
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    /// Reclaims every entry with zero references.
    ///
    /// Invoked after each script statement completes.
    pub fn purge_unreferenced(&mut self) {
        self.entries.retain(|_, entry| entry.refcount > 0);
    }

    /// Number of live entries (excluding the implicit empty string).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the dictionary as ASCII lines `0x<hash8>: <len4>: <bytes>`.
    ///
    /// Preserves hashes of names seen in prior runs so `unhash` can report
    /// readable names while debugging.
    pub fn save_file(&self, path: &Path) -> ScriptResult<()> {
        let mut out = String::new();
        for (hash, entry) in &self.entries {
            let _ = write!(out, "0x{hash:08x}: {:04}: {}\r\n", entry.text.len(), entry.text);
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Loads a dictionary previously written by [`StringTable::save_file`].
    ///
    /// Loaded entries start unreferenced. Malformed lines are an error.
    pub fn load_file(&mut self, path: &Path) -> ScriptResult<()> {
        let text = std::fs::read_to_string(path)?;
        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let parsed = parse_table_line(line);
            let Some((hash, bytes)) = parsed else {
                return Err(ScriptError::io(format!(
                    "malformed string table line {}: {line:?}",
                    idx + 1
                )));
            };
            let stored = self.add(bytes)?;
            if stored != hash && !bytes.is_empty() {
                return Err(ScriptError::io(format!(
                    "string table line {} hash mismatch for {bytes:?}",
                    idx + 1
                )));
            }
        }
        Ok(())
    }
}

/// Parses one `0x<hash8>: <len4>: <bytes>` line.
fn parse_table_line(line: &str) -> Option<(u32, &str)> {
    let rest = line.strip_prefix("0x")?;
    let (hash_text, rest) = rest.split_once(": ")?;
    let (len_text, bytes) = rest.split_once(": ")?;
    let hash = u32::from_str_radix(hash_text, 16).ok()?;
    let len: usize = len_text.parse().ok()?;
    if bytes.len() != len {
        return None;
    }
    Some((hash, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get() {
        let mut table = StringTable::new();
        let hash = table.add("hello").unwrap();
        assert_eq!(table.get(hash), Some("hello"));
        assert_eq!(table.get(0), Some(""));
    }

    #[test]
    fn re_adding_is_idempotent() {
        let mut table = StringTable::new();
        let a = table.add("hello").unwrap();
        let b = table.add("hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn purge_reclaims_released_entries() {
        let mut table = StringTable::new();
        let kept = table.add("kept").unwrap();
        let dropped = table.add("dropped").unwrap();
        table.decrement(dropped);
        table.purge_unreferenced();
        assert_eq!(table.get(kept), Some("kept"));
        assert_eq!(table.get(dropped), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn decrement_saturates() {
        let mut table = StringTable::new();
        let hash = table.add("x").unwrap();
        table.decrement(hash);
        table.decrement(hash);
        table.increment(hash);
        table.purge_unreferenced();
        assert_eq!(table.get(hash), Some("x"));
    }

    #[test]
    fn collision_is_fatal() {
        // these two strings genuinely collide under the rolling hash
        assert_eq!(crate::hash::hash_string("lnsadhd"), crate::hash::hash_string("scbiwzl"));
        let mut table = StringTable::new();
        table.add("lnsadhd").unwrap();
        let err = table.add("scbiwzl").unwrap_err();
        assert!(err.message.contains("collision"));
    }

    #[test]
    fn unhash_unknown() {
        let table = StringTable::new();
        assert_eq!(table.unhash(0xdeadbeef), "<hash:0xdeadbeef>");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stringtable.txt");

        let mut table = StringTable::new();
        let a = table.add("alpha").unwrap();
        let b = table.add("beta gamma").unwrap();
        table.save_file(&path).unwrap();

        let mut loaded = StringTable::new();
        loaded.load_file(&path).unwrap();
        assert_eq!(loaded.get(a), Some("alpha"));
        assert_eq!(loaded.get(b), Some("beta gamma"));
    }
}
