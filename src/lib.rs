//! Toolchain for unpacking Xbox 360 game packages ahead of static
//! recompilation: STFS container extraction, XEX2 decryption and LZX
//! decompression into a flat PE image, and recovery of the PowerPC jump
//! tables behind `bctr`-dispatched switches.
#![warn(clippy::unwrap_used, clippy::panic)]

pub mod bitstream;
pub mod emit;
pub mod error;
pub mod huffman;
pub mod lzx;
pub mod ppc;
pub mod stfs;
pub mod switches;
pub mod xex;

pub use crate::error::{Error, Result};
pub use crate::lzx::LzxDecoder;
pub use crate::stfs::Package;
pub use crate::switches::{ScanConfig, SiteOutcome, SwitchTable};
pub use crate::xex::Xex;
