use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the container parsers and the LZX decoder.
///
/// Format violations abort the operation that detected them and carry the
/// byte offset where detection occurred. Switch-recovery misses are not
/// errors; the scan continues and reports them per site in the emitted
/// configuration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad magic {found:02X?}, expected {expected}")]
    BadMagic { expected: &'static str, found: [u8; 4] },

    #[error("{what} at offset {offset:#x}")]
    Format { what: String, offset: u64 },

    #[error("invalid LZX block type {value} at input offset {offset:#x}")]
    BlockType { value: u8, offset: u64 },

    #[error("over-subscribed code lengths for the {tree} tree at input offset {offset:#x}")]
    CorruptTree { tree: &'static str, offset: u64 },

    #[error("window_bits must be in 15..=21, got {0}")]
    WindowBits(u32),

    #[error("{what}: {offset:#x} is past the {len:#x}-byte input")]
    Bounds { what: &'static str, offset: u64, len: u64 },

    #[error("digest mismatch for the compressed block at offset {offset:#x}")]
    BlockDigest { offset: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("override config: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn format(what: impl Into<String>, offset: u64) -> Self {
        Error::Format {
            what: what.into(),
            offset,
        }
    }
}
