//! On-disk cache of compiled blocks.
//!
//! A source file `foo.ts` may be cached as `foo.tso`: a small header plus
//! the serialized instruction buffer and line table. The cache is loaded
//! when its modification time is newer than the source's; otherwise the
//! source is recompiled and the cache rewritten. This is a same-host
//! optimization only; cross-platform portability is not a goal.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::bytecode::CodeBlock;
use crate::error::{ScriptError, ScriptResult};

/// Identifies the cache format; bump when the opcode set changes shape.
const CACHE_MAGIC: u32 = 0x5453_4f42; // "TSOB"
const CACHE_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct CacheImage {
    magic: u32,
    version: u32,
    block: CodeBlock,
}

/// The cache path for a script: same stem, `.tso` extension. `None` when
/// the source has no usable extension.
#[must_use]
pub fn cache_path(source: &Path) -> Option<PathBuf> {
    source.extension()?;
    Some(source.with_extension("tso"))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when a cache exists and is at least as new as the source.
#[must_use]
pub fn cache_is_fresh(source: &Path, cache: &Path) -> bool {
    match (modified(source), modified(cache)) {
        (Some(src), Some(cached)) => cached >= src,
        _ => false,
    }
}

/// Writes a compiled block to its cache file.
pub fn save_block(block: &CodeBlock, path: &Path) -> ScriptResult<()> {
    let image = CacheImage {
        magic: CACHE_MAGIC,
        version: CACHE_VERSION,
        block: block.clone(),
    };
    let bytes = postcard::to_allocvec(&image)
        .map_err(|e| ScriptError::io(format!("unable to serialize compiled cache: {e}")))?;
    std::fs::write(path, bytes).map_err(|e| ScriptError::io(format!("unable to write {}: {e}", path.display())))?;
    Ok(())
}

/// Reads a compiled block back from its cache file.
pub fn load_block(path: &Path) -> ScriptResult<CodeBlock> {
    let bytes =
        std::fs::read(path).map_err(|e| ScriptError::io(format!("unable to read {}: {e}", path.display())))?;
    let image: CacheImage = postcard::from_bytes(&bytes)
        .map_err(|e| ScriptError::io(format!("malformed compiled cache {}: {e}", path.display())))?;
    if image.magic != CACHE_MAGIC || image.version != CACHE_VERSION {
        return Err(ScriptError::io(format!(
            "compiled cache {} has an incompatible format",
            path.display()
        )));
    }
    Ok(image.block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_swaps_extension() {
        assert_eq!(cache_path(Path::new("scripts/game.ts")), Some(PathBuf::from("scripts/game.tso")));
        assert_eq!(cache_path(Path::new("no_extension")), None);
    }

    #[test]
    fn save_load_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.tso");
        let block = CodeBlock::new("game.ts", 77, vec![1, 2, 3, 4], vec![(0 << 16) | 1]);
        save_block(&block, &path).unwrap();
        let loaded = load_block(&path).unwrap();
        assert_eq!(loaded.instructions(), block.instructions());
        assert_eq!(loaded.line_numbers(), block.line_numbers());
        assert_eq!(loaded.filename_hash(), block.filename_hash());
    }

    #[test]
    fn truncated_cache_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tso");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let err = load_block(&path).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Io);
    }
}
