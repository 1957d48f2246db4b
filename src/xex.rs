//! XEX2 executable parsing: optional-header directory, AES-CBC key unwrap,
//! and the three payload layouts (uncompressed, basic zero-run blocks,
//! LZX-compressed block chain) that all end in a flat PE image at the
//! advertised size.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use aes::Aes128;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::lzx::LzxDecoder;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Retail key that wraps every XEX2 per-file key.
const RETAIL_KEY: [u8; 16] = [
    0x20, 0xB1, 0x85, 0xA5, 0x9D, 0x28, 0xFD, 0xC3, 0x40, 0x58, 0x3F, 0xBB, 0x08, 0x96, 0xBF,
    0x91,
];
const ZERO_IV: [u8; 16] = [0u8; 16];
/// Offset of the encrypted file key inside the security info block.
const SECURITY_KEY_OFFSET: usize = 0x150;
/// Offset of the load address inside the security info block.
const SECURITY_LOAD_ADDRESS_OFFSET: usize = 0x110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    Cbc,
}

#[derive(Debug, Clone, Copy)]
struct BasicBlock {
    data_size: u32,
    zero_size: u32,
}

#[derive(Debug, Clone)]
struct BlockDescriptor {
    size: u32,
    digest: [u8; 20],
}

#[derive(Debug)]
enum Compression {
    None,
    Basic(Vec<BasicBlock>),
    Normal {
        window_bits: u32,
        first: BlockDescriptor,
    },
}

/// A parsed XEX2 container over borrowed file bytes.
#[derive(Debug)]
pub struct Xex<'a> {
    data: &'a [u8],
    pub entry_point: u32,
    pub image_base: u32,
    pub load_address: u32,
    pub image_size: usize,
    pub encryption: Encryption,
    pe_data_offset: usize,
    compression: Compression,
    file_key: Option<[u8; 16]>,
}

impl<'a> Xex<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Xex<'a>> {
        let magic = read_bytes::<4>(data, 0, "magic")?;
        if &magic != b"XEX2" {
            return Err(Error::BadMagic {
                expected: "XEX2",
                found: magic,
            });
        }

        let pe_data_offset = be32(data, 8)? as usize;
        let security_offset = be32(data, 16)? as usize;
        let header_count = be32(data, 20)? as usize;

        let mut ffi_offset = 0usize;
        let mut entry_point = 0u32;
        let mut image_base = 0u32;
        let mut pos = 24;
        for _ in 0..header_count {
            let id = be32(data, pos)?;
            let value = be32(data, pos + 4)?;
            match (id >> 8) & 0xFF_FFFF {
                0x00_0003 => ffi_offset = value as usize,
                0x00_0101 => entry_point = value,
                0x00_0102 => image_base = value,
                _ => {}
            }
            pos += 8;
        }
        if ffi_offset == 0 {
            return Err(Error::format("missing file format info header", 24));
        }

        let ffi_size = be32(data, ffi_offset)? as usize;
        let encryption = match be16(data, ffi_offset + 4)? {
            0 => Encryption::None,
            1 => Encryption::Cbc,
            other => {
                return Err(Error::format(
                    format!("unknown encryption type {other}"),
                    (ffi_offset + 4) as u64,
                ))
            }
        };
        let compression_type = be16(data, ffi_offset + 6)?;

        let image_size = be32(data, security_offset + 4)? as usize;
        let load_address = be32(data, security_offset + SECURITY_LOAD_ADDRESS_OFFSET)?;

        let file_key = match encryption {
            Encryption::Cbc => {
                let mut key = read_bytes::<16>(data, security_offset + SECURITY_KEY_OFFSET, "file key")?;
                Aes128CbcDec::new(&RETAIL_KEY.into(), &ZERO_IV.into())
                    .decrypt_padded_mut::<NoPadding>(&mut key)
                    .map_err(|_| {
                        Error::format("file key unwrap failed", (security_offset + SECURITY_KEY_OFFSET) as u64)
                    })?;
                Some(key)
            }
            Encryption::None => None,
        };

        let compression = match compression_type {
            0 => Compression::None,
            1 => {
                let mut blocks = Vec::new();
                let mut pos = ffi_offset + 8;
                while pos + 8 <= ffi_offset + ffi_size {
                    let data_size = be32(data, pos)?;
                    let zero_size = be32(data, pos + 4)?;
                    if data_size == 0 && zero_size == 0 {
                        break;
                    }
                    blocks.push(BasicBlock {
                        data_size,
                        zero_size,
                    });
                    pos += 8;
                }
                Compression::Basic(blocks)
            }
            2 => {
                let window_size = be32(data, ffi_offset + 8)?;
                if !window_size.is_power_of_two() {
                    return Err(Error::format(
                        format!("window size {window_size:#x} is not a power of two"),
                        (ffi_offset + 8) as u64,
                    ));
                }
                let size = be32(data, ffi_offset + 12)?;
                let digest = read_bytes::<20>(data, ffi_offset + 16, "block digest")?;
                Compression::Normal {
                    window_bits: window_size.trailing_zeros(),
                    first: BlockDescriptor { size, digest },
                }
            }
            other => {
                return Err(Error::format(
                    format!("unsupported compression type {other}"),
                    (ffi_offset + 6) as u64,
                ))
            }
        };

        log::info!(
            "XEX2: entry point {entry_point:#010x}, image base {image_base:#010x}, \
             image size {image_size:#x}, encryption {encryption:?}"
        );

        Ok(Xex {
            data,
            entry_point,
            image_base,
            load_address,
            image_size,
            encryption,
            pe_data_offset,
            compression,
            file_key,
        })
    }

    /// Decrypt and decompress the PE payload into a flat image of
    /// `image_size` bytes. An uncompressed payload is only truncated, so a
    /// short input yields a short image.
    pub fn load_pe(&self) -> Result<Vec<u8>> {
        let raw = self.data.get(self.pe_data_offset..).ok_or(Error::Bounds {
            what: "PE data",
            offset: self.pe_data_offset as u64,
            len: self.data.len() as u64,
        })?;

        let payload = match self.file_key {
            Some(key) => {
                let mut buf = raw.to_vec();
                buf.resize(raw.len().next_multiple_of(16), 0);
                Aes128CbcDec::new(&key.into(), &ZERO_IV.into())
                    .decrypt_padded_mut::<NoPadding>(&mut buf)
                    .map_err(|_| {
                        Error::format("payload decryption failed", self.pe_data_offset as u64)
                    })?;
                buf
            }
            None => raw.to_vec(),
        };

        match &self.compression {
            Compression::None => {
                let mut image = payload;
                if image.len() < self.image_size {
                    log::warn!(
                        "payload is {} bytes short of the image size",
                        self.image_size - image.len()
                    );
                }
                image.truncate(self.image_size);
                Ok(image)
            }
            Compression::Basic(blocks) => Ok(self.assemble_basic(&payload, blocks)),
            Compression::Normal { window_bits, first } => {
                let stream = concat_block_chunks(&payload, first)?;
                log::debug!(
                    "LZX stream: {} bytes from {} payload bytes, window 2^{window_bits}",
                    stream.len(),
                    payload.len()
                );
                let mut lzx = LzxDecoder::new(*window_bits)?;
                lzx.decompress(&stream, self.image_size)
            }
        }
    }

    /// Basic compression: copy each data run, skip each zero run.
    fn assemble_basic(&self, payload: &[u8], blocks: &[BasicBlock]) -> Vec<u8> {
        let total: usize = blocks
            .iter()
            .map(|b| (b.data_size + b.zero_size) as usize)
            .sum();
        let mut image = vec![0u8; self.image_size.max(total)];

        let mut src = 0usize;
        let mut dst = 0usize;
        for block in blocks {
            let data_size = block.data_size as usize;
            if src + data_size > payload.len() {
                // Truncated input: keep what is there, the zero runs stand.
                let avail = payload.len().saturating_sub(src);
                image[dst..dst + avail].copy_from_slice(&payload[src..]);
                break;
            }
            image[dst..dst + data_size].copy_from_slice(&payload[src..src + data_size]);
            src += data_size;
            dst += data_size + block.zero_size as usize;
        }

        image.truncate(self.image_size);
        image
    }
}

/// Walk the block chain: each block is digest-checked, opens with the next
/// block's descriptor, and carries `(BE16 size, data)` chunks until a zero
/// size. The concatenated chunk payloads form the LZX input stream.
fn concat_block_chunks(payload: &[u8], first: &BlockDescriptor) -> Result<Vec<u8>> {
    let mut stream = Vec::new();
    let mut pos = 0usize;
    let mut descriptor = first.clone();

    while descriptor.size != 0 {
        let size = descriptor.size as usize;
        let block = payload.get(pos..pos + size).ok_or(Error::Bounds {
            what: "compressed block",
            offset: (pos + size) as u64,
            len: payload.len() as u64,
        })?;

        let digest = Sha1::digest(block);
        if digest[..] != descriptor.digest {
            return Err(Error::BlockDigest { offset: pos as u64 });
        }
        if size < 24 {
            return Err(Error::format("compressed block too small", pos as u64));
        }

        let mut next_digest = [0u8; 20];
        next_digest.copy_from_slice(&block[4..24]);
        descriptor = BlockDescriptor {
            size: u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
            digest: next_digest,
        };

        let mut p = 24usize;
        loop {
            let chunk = be16(block, p)? as usize;
            p += 2;
            if chunk == 0 {
                break;
            }
            let data = block.get(p..p + chunk).ok_or(Error::Bounds {
                what: "block chunk",
                offset: (pos + p + chunk) as u64,
                len: payload.len() as u64,
            })?;
            stream.extend_from_slice(data);
            p += chunk;
        }

        pos += size;
    }

    Ok(stream)
}

fn be32(data: &[u8], off: usize) -> Result<u32> {
    let bytes = read_bytes::<4>(data, off, "u32 field")?;
    Ok(u32::from_be_bytes(bytes))
}

fn be16(data: &[u8], off: usize) -> Result<u16> {
    let bytes = read_bytes::<2>(data, off, "u16 field")?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_bytes<const N: usize>(data: &[u8], off: usize, what: &'static str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    match data.get(off..off + N) {
        Some(bytes) => {
            out.copy_from_slice(bytes);
            Ok(out)
        }
        None => Err(Error::Bounds {
            what,
            offset: (off + N) as u64,
            len: data.len() as u64,
        }),
    }
}
