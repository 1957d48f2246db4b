//! LZX decompression as used by XEX2 "normal" compression.
//!
//! The stream is a sequence of blocks, each with private Huffman trees and a
//! 24-bit output length. Output is additionally partitioned into frames of one
//! window size; at every frame boundary the input bitstream is realigned to a
//! 16-bit word. Blocks and frames move independently: a single match may run
//! past either boundary, and the overshoot is settled by plain signed
//! arithmetic on the budgets rather than by splitting the copy.

use crate::bitstream::Bitstream;
use crate::error::{Error, Result};
use crate::huffman::Tree;

const NUM_CHARS: usize = 256;
const MIN_MATCH: usize = 2;
const NUM_PRIMARY_LENGTHS: usize = 7;

const PRETREE_NUM_ELEMENTS: usize = 20;
const PRETREE_TABLE_BITS: u32 = 6;
const PRETREE_MAX_CODEWORD: u32 = 16;

const MAINTREE_TABLE_BITS: u32 = 11;
const MAINTREE_MAX_CODEWORD: u32 = 16;

const LENTREE_NUM_ELEMENTS: usize = 249;
const LENTREE_TABLE_BITS: u32 = 10;
const LENTREE_MAX_CODEWORD: u32 = 16;

const ALIGNTREE_NUM_ELEMENTS: usize = 8;
const ALIGNTREE_TABLE_BITS: u32 = 7;
const ALIGNTREE_MAX_CODEWORD: u32 = 8;

const POSITION_BASE: [u32; 51] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536,
    2048, 3072, 4096, 6144, 8192, 12288, 16384, 24576, 32768, 49152, 65536, 98304, 131072, 196608,
    262144, 393216, 524288, 655360, 786432, 917504, 1048576, 1179648, 1310720, 1441792, 1572864,
    1703936, 1835008, 1966080, 2097152,
];

const EXTRA_BITS: [u32; 51] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13, 14, 14, 15, 15, 16, 16, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17,
];

/// Window subdivisions per window size exponent.
fn position_slots(window_bits: u32) -> Option<usize> {
    Some(match window_bits {
        15 => 30,
        16 => 32,
        17 => 34,
        18 => 36,
        19 => 38,
        20 => 42,
        21 => 50,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Invalid,
    Verbatim,
    Aligned,
    Uncompressed,
}

/// Stateful LZX decompressor.
///
/// One instance owns its sliding window, repeated-offset list and tree state
/// for the duration of a [`decompress`](Self::decompress) call. State carries
/// across calls on the same instance; after a decode error the window contents
/// are unspecified and the instance must not be reused.
pub struct LzxDecoder {
    /// Sliding window, initialised to 0xDC throughout.
    window: Vec<u8>,
    window_mask: usize,
    window_posn: usize,

    /// Most recent real match offsets, most recent first.
    r0: u32,
    r1: u32,
    r2: u32,

    main_elements: usize,
    pretree: Tree,
    maintree: Tree,
    lentree: Tree,
    aligntree: Tree,

    block_type: BlockType,
    block_length: usize,
    /// Output bytes still owed by the current block. Goes negative when a
    /// match straddles the block boundary; the carry is settled on the next
    /// loop iteration without decoding anything.
    block_remaining: i64,

    header_read: bool,
    intel_filesize: u32,
    intel_curpos: u64,
    intel_started: bool,
}

impl LzxDecoder {
    pub fn new(window_bits: u32) -> Result<Self> {
        let slots = position_slots(window_bits).ok_or(Error::WindowBits(window_bits))?;
        let window_size = 1usize << window_bits;
        let main_elements = NUM_CHARS + (slots << 3);

        Ok(Self {
            window: vec![0xDC; window_size],
            window_mask: window_size - 1,
            window_posn: 0,
            r0: 1,
            r1: 1,
            r2: 1,
            main_elements,
            pretree: Tree::new(PRETREE_NUM_ELEMENTS, PRETREE_TABLE_BITS, PRETREE_MAX_CODEWORD),
            maintree: Tree::new(main_elements, MAINTREE_TABLE_BITS, MAINTREE_MAX_CODEWORD),
            lentree: Tree::new(LENTREE_NUM_ELEMENTS, LENTREE_TABLE_BITS, LENTREE_MAX_CODEWORD),
            aligntree: Tree::new(
                ALIGNTREE_NUM_ELEMENTS,
                ALIGNTREE_TABLE_BITS,
                ALIGNTREE_MAX_CODEWORD,
            ),
            block_type: BlockType::Invalid,
            block_length: 0,
            block_remaining: 0,
            header_read: false,
            intel_filesize: 0,
            intel_curpos: 0,
            intel_started: false,
        })
    }

    /// Decompress `data` into exactly `output_size` bytes.
    ///
    /// Short reads past the end of `data` supply zero bits; truncation is
    /// only detectable by the caller through the output byte count, so the
    /// expected size must come from the container.
    pub fn decompress(&mut self, data: &[u8], output_size: usize) -> Result<Vec<u8>> {
        let mut bs = Bitstream::new(data);
        let mut output = vec![0u8; output_size];
        let mut out_pos = 0usize;
        let frame_size = self.window.len();
        let mut window_posn = self.window_posn;
        let mut frame_posn = 0usize;

        if !self.header_read {
            if bs.read(1) != 0 {
                let hi = bs.read(16);
                let lo = bs.read(16);
                self.intel_filesize = (hi << 16) | lo;
            }
            self.intel_started = false;
            self.header_read = true;
            log::debug!("E8 translation file size {:#x}", self.intel_filesize);
        }

        while out_pos < output_size {
            let cur_frame_size = frame_size.min(output_size - out_pos);

            // A match in the previous frame may already have decoded into this
            // one; window_posn runs ahead of frame_posn and the difference
            // comes straight out of this frame's budget.
            let mut bytes_todo = frame_posn as i64 + cur_frame_size as i64 - window_posn as i64;
            if bytes_todo < 0 {
                bytes_todo = 0;
            }

            while bytes_todo > 0 {
                if self.block_remaining == 0 {
                    self.read_block_header(&mut bs)?;
                    log::debug!(
                        "block {:?}, {} bytes at input offset {:#x}",
                        self.block_type,
                        self.block_length,
                        bs.position()
                    );
                }

                // A negative remainder from a block-straddling match lands
                // here: this_run picks it up, the subtractions hand the
                // overshoot back to bytes_todo, and nothing is decoded.
                let mut this_run = self.block_remaining.min(bytes_todo);
                bytes_todo -= this_run;
                self.block_remaining -= this_run;
                if this_run <= 0 {
                    continue;
                }

                match self.block_type {
                    BlockType::Uncompressed => {
                        for _ in 0..this_run {
                            self.window[window_posn & self.window_mask] = bs.next_byte();
                            window_posn += 1;
                        }
                    }
                    kind @ (BlockType::Verbatim | BlockType::Aligned) => {
                        while this_run > 0 {
                            let main_element = usize::from(self.maintree.decode(&mut bs));

                            if main_element < NUM_CHARS {
                                self.window[window_posn & self.window_mask] = main_element as u8;
                                window_posn += 1;
                                this_run -= 1;
                                continue;
                            }

                            let m = main_element - NUM_CHARS;
                            let mut match_length = m & NUM_PRIMARY_LENGTHS;
                            if match_length == NUM_PRIMARY_LENGTHS {
                                match_length += usize::from(self.lentree.decode(&mut bs));
                            }
                            match_length += MIN_MATCH;

                            let slot = m >> 3;
                            let match_offset = match slot {
                                0 => self.r0,
                                1 => {
                                    let offset = self.r1;
                                    self.r1 = self.r0;
                                    self.r0 = offset;
                                    offset
                                }
                                2 => {
                                    let offset = self.r2;
                                    self.r2 = self.r0;
                                    self.r0 = offset;
                                    offset
                                }
                                _ => {
                                    let extra = EXTRA_BITS[slot];
                                    let (verbatim_bits, aligned_bits) =
                                        if kind == BlockType::Aligned && extra >= 3 {
                                            let v = bs.read(extra - 3) << 3;
                                            let a = u32::from(self.aligntree.decode(&mut bs));
                                            (v, a)
                                        } else {
                                            (bs.read(extra), 0)
                                        };
                                    let offset =
                                        POSITION_BASE[slot] + verbatim_bits + aligned_bits - 2;
                                    self.r2 = self.r1;
                                    self.r1 = self.r0;
                                    self.r0 = offset;
                                    offset
                                }
                            };

                            this_run -= match_length as i64;

                            // Byte at a time: a self-overlapping match must
                            // re-read the bytes it just produced.
                            let mut runsrc = window_posn.wrapping_sub(match_offset as usize)
                                & self.window_mask;
                            for _ in 0..match_length {
                                self.window[window_posn & self.window_mask] = self.window[runsrc];
                                window_posn += 1;
                                runsrc = (runsrc + 1) & self.window_mask;
                            }
                        }

                        // Charge the match overshoot back to the block.
                        if this_run < 0 {
                            self.block_remaining += this_run;
                        }
                    }
                    BlockType::Invalid => {
                        return Err(Error::format(
                            "block data before any block header",
                            bs.position(),
                        ));
                    }
                }
            }

            bs.align_to_word();

            let mut wp = frame_posn & self.window_mask;
            for _ in 0..cur_frame_size {
                output[out_pos] = self.window[wp];
                wp = (wp + 1) & self.window_mask;
                out_pos += 1;
            }
            frame_posn += cur_frame_size;
        }

        self.window_posn = window_posn & self.window_mask;

        if self.intel_started && output_size > 10 {
            self.undo_e8(&mut output);
        }
        self.intel_curpos += output_size as u64;

        Ok(output)
    }

    fn read_block_header(&mut self, bs: &mut Bitstream) -> Result<()> {
        // Uncompressed payloads end byte-aligned; odd lengths carry one pad
        // byte before the next header.
        if self.block_type == BlockType::Uncompressed {
            if self.block_length & 1 == 1 {
                bs.skip_byte();
            }
            bs.reset();
        }

        let value = bs.read(3) as u8;
        self.block_type = match value {
            1 => BlockType::Verbatim,
            2 => BlockType::Aligned,
            3 => BlockType::Uncompressed,
            _ => {
                return Err(Error::BlockType {
                    value,
                    offset: bs.position(),
                })
            }
        };
        self.block_length = bs.read_u24() as usize;
        self.block_remaining = self.block_length as i64;

        if self.block_type == BlockType::Aligned {
            for i in 0..ALIGNTREE_NUM_ELEMENTS {
                self.aligntree.lens_mut()[i] = bs.read(3) as u8;
            }
            self.aligntree.build().map_err(|()| Error::CorruptTree {
                tree: "aligned",
                offset: bs.position(),
            })?;
        }

        if self.block_type == BlockType::Uncompressed {
            self.intel_started = true;
            bs.resync_to_word();
            if bs.remaining() >= 12 {
                if let (Some(r0), Some(r1), Some(r2)) =
                    (bs.raw_le_u32(), bs.raw_le_u32(), bs.raw_le_u32())
                {
                    self.r0 = r0;
                    self.r1 = r1;
                    self.r2 = r2;
                }
            }
            return Ok(());
        }

        let pretree = &mut self.pretree;
        let maintree = &mut self.maintree;
        let lentree = &mut self.lentree;

        Self::read_lengths(pretree, maintree.lens_mut(), 0, NUM_CHARS, bs)?;
        Self::read_lengths(pretree, maintree.lens_mut(), NUM_CHARS, self.main_elements, bs)?;
        maintree.build().map_err(|()| Error::CorruptTree {
            tree: "main",
            offset: bs.position(),
        })?;

        // The encoder only assigns 0xE8 a code when call translation matters.
        if maintree.lens()[0xE8] != 0 {
            self.intel_started = true;
        }

        Self::read_lengths(pretree, lentree.lens_mut(), 0, LENTREE_NUM_ELEMENTS, bs)?;
        lentree.build().map_err(|()| Error::CorruptTree {
            tree: "length",
            offset: bs.position(),
        })?;

        Ok(())
    }

    /// Decode a code-length vector into `lens[first..last]` using the
    /// 20-symbol pretree. Lengths are deltas against the previous block's
    /// vector; runs of zeros and repeated values have dedicated opcodes.
    fn read_lengths(
        pretree: &mut Tree,
        lens: &mut [u8],
        first: usize,
        last: usize,
        bs: &mut Bitstream,
    ) -> Result<()> {
        for i in 0..PRETREE_NUM_ELEMENTS {
            pretree.lens_mut()[i] = bs.read(4) as u8;
        }
        pretree.build().map_err(|()| Error::CorruptTree {
            tree: "pretree",
            offset: bs.position(),
        })?;

        let mut x = first;
        while x < last {
            match pretree.decode(bs) {
                17 => {
                    let run = bs.read(4) as usize + 4;
                    let end = Self::run_end(x, run, lens.len(), bs)?;
                    lens[x..end].fill(0);
                    x = end;
                }
                18 => {
                    let run = bs.read(5) as usize + 20;
                    let end = Self::run_end(x, run, lens.len(), bs)?;
                    lens[x..end].fill(0);
                    x = end;
                }
                19 => {
                    let run = bs.read(1) as usize + 4;
                    let code = pretree.decode(bs);
                    let value = delta_len(lens[x], code);
                    let end = Self::run_end(x, run, lens.len(), bs)?;
                    lens[x..end].fill(value);
                    x = end;
                }
                code => {
                    lens[x] = delta_len(lens[x], code);
                    x += 1;
                }
            }
        }
        Ok(())
    }

    fn run_end(x: usize, run: usize, cap: usize, bs: &Bitstream) -> Result<usize> {
        let end = x + run;
        if end > cap {
            return Err(Error::format(
                "pretree run overflows the length table",
                bs.position(),
            ));
        }
        Ok(end)
    }

    /// Undo the encoder's x86 CALL displacement transform: any 0xE8 byte is
    /// followed by a 32-bit absolute target that must become relative again.
    fn undo_e8(&self, data: &mut [u8]) {
        if self.intel_curpos >= 0x4000_0000 {
            return;
        }
        let filesize = i64::from(self.intel_filesize);

        let mut i = 0usize;
        while i < data.len() - 10 {
            if data[i] != 0xE8 {
                i += 1;
                continue;
            }

            let cur = self.intel_curpos as i64 + i as i64;
            let abs = i64::from(i32::from_le_bytes([
                data[i + 1],
                data[i + 2],
                data[i + 3],
                data[i + 4],
            ]));

            if abs >= -cur && abs < filesize {
                let rel = if abs >= 0 { abs - cur } else { abs + filesize };
                data[i + 1..i + 5].copy_from_slice(&(rel as u32).to_le_bytes());
            }

            i += 5;
        }
    }
}

fn delta_len(prev: u8, code: u16) -> u8 {
    (i32::from(prev) + 17 - i32::from(code)).rem_euclid(17) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirror of the reader: MSB-first bits packed into LE 16-bit words, with
    /// byte-aligned raw stretches for uncompressed payloads.
    struct BitWriter {
        out: Vec<u8>,
        acc: u64,
        n: u32,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                out: Vec::new(),
                acc: 0,
                n: 0,
            }
        }

        fn push(&mut self, value: u32, count: u32) {
            self.acc = (self.acc << count) | u64::from(value);
            self.n += count;
            while self.n >= 16 {
                let word = ((self.acc >> (self.n - 16)) & 0xFFFF) as u16;
                self.out.extend_from_slice(&word.to_le_bytes());
                self.n -= 16;
            }
        }

        fn push_u24(&mut self, value: u32) {
            self.push(value >> 8, 16);
            self.push(value & 0xFF, 8);
        }

        fn align16(&mut self) {
            if self.n > 0 {
                let pad = 16 - self.n;
                self.push(0, pad);
            }
        }

        fn raw(&mut self, bytes: &[u8]) {
            assert_eq!(self.n, 0, "raw bytes must start word-aligned");
            self.out.extend_from_slice(bytes);
        }

        fn into_bytes(mut self) -> Vec<u8> {
            self.align16();
            self.out
        }
    }

    /// Pretree with lengths 4 for symbols 0..12 and 5 for 12..20, so every
    /// opcode is expressible: codes 0..12 are the symbol value in 4 bits,
    /// 12..20 are `24 + (sym - 12)` in 5 bits.
    fn push_pretree_code(w: &mut BitWriter, sym: u32) {
        if sym < 12 {
            w.push(sym, 4);
        } else {
            w.push(24 + sym - 12, 5);
        }
    }

    /// Encode `new` against `prev` using only plain delta opcodes.
    fn push_lengths(w: &mut BitWriter, prev: &[u8], new: &[u8]) {
        for sym in 0..20 {
            w.push(if sym < 12 { 4 } else { 5 }, 4);
        }
        for (i, &len) in new.iter().enumerate() {
            let z = (i32::from(prev[i]) - i32::from(len)).rem_euclid(17) as u32;
            push_pretree_code(w, z);
        }
    }

    fn zero_lens(n: usize) -> Vec<u8> {
        vec![0; n]
    }

    /// Verbatim block header for window_bits 15 (main_elements = 496).
    fn push_verbatim_header(
        w: &mut BitWriter,
        block_length: u32,
        prev_main: &[u8],
        main_lens: &[u8],
        prev_len: &[u8],
        len_lens: &[u8],
    ) {
        w.push(1, 3);
        w.push_u24(block_length);
        push_lengths(w, &prev_main[..256], &main_lens[..256]);
        push_lengths(w, &prev_main[256..], &main_lens[256..]);
        push_lengths(w, prev_len, len_lens);
    }

    #[test]
    fn empty_input_decodes_to_nothing() {
        for bits in 15..=21 {
            let mut lzx = LzxDecoder::new(bits).unwrap();
            assert_eq!(lzx.decompress(&[], 0).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn rejects_window_bits_out_of_range() {
        assert!(matches!(LzxDecoder::new(14), Err(Error::WindowBits(14))));
        assert!(matches!(LzxDecoder::new(22), Err(Error::WindowBits(22))));
    }

    #[test_log::test]
    fn uncompressed_block_round_trip() {
        let payload = b"uncompressed";
        let mut w = BitWriter::new();
        w.push(0, 1); // no E8 header fields
        w.push(3, 3);
        w.push_u24(payload.len() as u32);
        w.align16();
        for r in [1u32, 1, 1] {
            w.raw(&r.to_le_bytes());
        }
        w.raw(payload);

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test_log::test]
    fn repeated_offset_zero_handles_overlapping_copy() {
        // One literal 'A' and a slot-0 match of length 7 with R0 = 1: the
        // match source chases the write cursor, repeating the literal.
        let mut main_lens = zero_lens(496);
        main_lens[b'A' as usize] = 1;
        main_lens[261] = 1; // slot 0, primary length 5

        let mut w = BitWriter::new();
        w.push(0, 1);
        push_verbatim_header(&mut w, 8, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        w.push(0, 1); // literal 'A'
        w.push(1, 1); // match element 261

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 8).unwrap();
        assert_eq!(out, b"AAAAAAAA");
    }

    #[test_log::test]
    fn lru_offsets_promote_without_loss() {
        // Symbols, all length 3: literals a..d and four match elements.
        //   265 = slot 1, length 3;  272 = slot 2, length 2;
        //   288 = slot 4, length 2;  296 = slot 5, length 2.
        let mut main_lens = zero_lens(496);
        for sym in [97usize, 98, 99, 100, 265, 272, 288, 296] {
            main_lens[sym] = 3;
        }

        let mut w = BitWriter::new();
        w.push(0, 1);
        push_verbatim_header(&mut w, 13, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        // Canonical codes in symbol order: a=000 .. 296=111.
        w.push(0, 3); // 'a'
        w.push(1, 3); // 'b'
        w.push(2, 3); // 'c'
        w.push(3, 3); // 'd'
        w.push(7, 3); // slot 5: base 6, 1 extra bit
        w.push(0, 1); //   -> offset 4, R = (4,1,1)
        w.push(6, 3); // slot 4: base 4, 1 extra bit
        w.push(0, 1); //   -> offset 2, R = (2,4,1)
        w.push(4, 3); // slot 1 reuse -> offset 4, R = (4,2,1)
        w.push(5, 3); // slot 2 reuse -> offset 1, R = (1,2,4)

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 13).unwrap();
        assert_eq!(out, b"abcdabababaaa");
    }

    #[test_log::test]
    fn aligned_block_reads_low_offset_bits_from_the_aligned_tree() {
        // 20 literals, then a slot-8 match whose low three offset bits come
        // from the aligned tree: offset 16 + 3 - 2 = 17 reaches back to the
        // two distinct literals at positions 3 and 4.
        let mut main_lens = zero_lens(496);
        main_lens[b'x' as usize] = 1;
        main_lens[b'a' as usize] = 2;
        main_lens[b'b' as usize] = 3;
        main_lens[320] = 3; // slot 8, primary length 0

        let mut w = BitWriter::new();
        w.push(0, 1);
        w.push(2, 3); // aligned block
        w.push_u24(22);
        for _ in 0..8 {
            w.push(3, 3); // aligned tree: every symbol at length 3
        }
        push_lengths(&mut w, &zero_lens(256), &main_lens[..256]);
        push_lengths(&mut w, &zero_lens(240), &main_lens[256..]);
        push_lengths(&mut w, &zero_lens(249), &zero_lens(249));

        for i in 0..20u32 {
            match i {
                3 => w.push(0b10, 2),  // 'a'
                4 => w.push(0b110, 3), // 'b'
                _ => w.push(0, 1),     // 'x'
            }
        }
        w.push(0b111, 3); // match element 320
        w.push(3, 3);     // aligned symbol 3 (no verbatim bits at slot 8)

        let mut expected = vec![b'x'; 20];
        expected[3] = b'a';
        expected[4] = b'b';
        expected.extend_from_slice(b"ab");

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 22).unwrap();
        assert_eq!(out, expected);
    }

    #[test_log::test]
    fn match_overshoots_the_frame_boundary() {
        // 32766 literals then a length-4 match: the match decodes two bytes
        // past the first 32 KiB frame, and the second frame settles the
        // overshoot without decoding anything new.
        let mut main_lens = zero_lens(496);
        main_lens[b'A' as usize] = 1;
        main_lens[258] = 1; // slot 0, primary length 2

        let mut w = BitWriter::new();
        w.push(0, 1);
        push_verbatim_header(&mut w, 32770, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        for _ in 0..32766 {
            w.push(0, 1);
        }
        w.push(1, 1);

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 32770).unwrap();
        assert_eq!(out.len(), 32770);
        assert!(out.iter().all(|&b| b == b'A'));
    }

    #[test_log::test]
    fn second_block_lengths_are_deltas_against_the_first() {
        let mut main_lens = zero_lens(496);
        main_lens[b'A' as usize] = 1;
        main_lens[261] = 1;

        let mut w = BitWriter::new();
        w.push(0, 1);
        push_verbatim_header(&mut w, 8, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        w.push(0, 1);
        w.push(1, 1);
        // Same trees again: every delta is zero.
        push_verbatim_header(&mut w, 8, &main_lens, &main_lens, &zero_lens(249), &zero_lens(249));
        w.push(0, 1);
        w.push(1, 1);

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 16).unwrap();
        assert_eq!(out, b"AAAAAAAAAAAAAAAA");
    }

    #[test_log::test]
    fn odd_uncompressed_block_pads_before_the_next_header() {
        let mut main_lens = zero_lens(496);
        main_lens[b'a' as usize] = 1;
        main_lens[261] = 1; // keeps the tree complete; unused

        let mut w = BitWriter::new();
        w.push(0, 1);
        w.push(3, 3);
        w.push_u24(3);
        w.align16();
        for r in [1u32, 1, 1] {
            w.raw(&r.to_le_bytes());
        }
        w.raw(b"abc");
        w.raw(&[0]); // pad byte for the odd length
        push_verbatim_header(&mut w, 4, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        for _ in 0..4 {
            w.push(0, 1);
        }

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 7).unwrap();
        assert_eq!(out, b"abcaaaa");
    }

    #[test_log::test]
    fn e8_translation_rewrites_absolute_call_targets() {
        // Uncompressed blocks force intel_started; the header carries the
        // translation file size. The 0xE8 at offset 2 has target 0x40, which
        // becomes 0x40 - 2 relative to the stream position.
        let payload = [
            b'X', b'Y', 0xE8, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut w = BitWriter::new();
        w.push(1, 1);
        w.push(0, 16); // file size high
        w.push(0x1000, 16); // file size low
        w.push(3, 3);
        w.push_u24(payload.len() as u32);
        w.align16();
        for r in [1u32, 1, 1] {
            w.raw(&r.to_le_bytes());
        }
        w.raw(&payload);

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), payload.len()).unwrap();
        assert_eq!(out[..3], [b'X', b'Y', 0xE8]);
        assert_eq!(u32::from_le_bytes([out[3], out[4], out[5], out[6]]), 0x3E);
        assert_eq!(out[7..], payload[7..]);
    }

    #[test]
    fn e8_stays_off_without_the_main_tree_symbol() {
        // The translation size is present but no block ever gives 0xE8 a
        // code, so the post-pass must not run and two decoders agree.
        let mut main_lens = zero_lens(496);
        main_lens[b'Q' as usize] = 1;
        main_lens[261] = 1;

        let mut w = BitWriter::new();
        w.push(1, 1);
        w.push(0, 16);
        w.push(0x2000, 16);
        push_verbatim_header(&mut w, 16, &zero_lens(496), &main_lens, &zero_lens(249), &zero_lens(249));
        for _ in 0..9 {
            w.push(0, 1);
        }
        w.push(1, 1); // match fills the remaining 7 bytes
        let data = w.into_bytes();

        let mut first = LzxDecoder::new(15).unwrap();
        let mut second = LzxDecoder::new(15).unwrap();
        let out = first.decompress(&data, 16).unwrap();
        assert_eq!(out, b"QQQQQQQQQQQQQQQQ");
        assert_eq!(out, second.decompress(&data, 16).unwrap());
    }

    #[test]
    fn pretree_run_opcodes_fill_the_length_vector() {
        let mut w = BitWriter::new();
        for sym in 0..20 {
            w.push(if sym < 12 { 4 } else { 5 }, 4);
        }
        push_pretree_code(&mut w, 17); // zero run, 4 + 2
        w.push(2, 4);
        push_pretree_code(&mut w, 19); // repeat run, 4 + 1
        w.push(1, 1);
        push_pretree_code(&mut w, 13); // value (0 + 17 - 13) % 17 = 4
        push_pretree_code(&mut w, 16); // plain delta: (0 + 17 - 16) % 17 = 1
        push_pretree_code(&mut w, 18); // zero run, 20 + 8
        w.push(8, 5);
        let data = w.into_bytes();

        let mut pretree = Tree::new(20, 6, 16);
        let mut lens = vec![0u8; 40 + crate::huffman::LEN_SAFETY];
        let mut bs = Bitstream::new(&data);
        LzxDecoder::read_lengths(&mut pretree, &mut lens, 0, 40, &mut bs).unwrap();

        let mut expected = vec![0u8; 40];
        expected[6..11].fill(4);
        expected[11] = 1;
        assert_eq!(&lens[..40], &expected[..]);
    }

    #[test_log::test]
    fn long_matches_read_their_footer_from_the_length_tree() {
        // Primary length 7 defers to the length tree: footer symbol 1 gives
        // a match of 7 + 1 + 2 = 10 bytes.
        let mut main_lens = zero_lens(496);
        main_lens[b'z' as usize] = 1;
        main_lens[263] = 1; // slot 0, primary length 7
        let mut len_lens = zero_lens(249);
        len_lens[0] = 1;
        len_lens[1] = 1;

        let mut w = BitWriter::new();
        w.push(0, 1);
        push_verbatim_header(&mut w, 11, &zero_lens(496), &main_lens, &zero_lens(249), &len_lens);
        w.push(0, 1); // literal 'z'
        w.push(1, 1); // match element 263
        w.push(1, 1); // length-tree symbol 1

        let mut lzx = LzxDecoder::new(15).unwrap();
        let out = lzx.decompress(&w.into_bytes(), 11).unwrap();
        assert_eq!(out, b"zzzzzzzzzzz");
    }

    #[test]
    fn invalid_block_type_is_a_format_error() {
        let mut w = BitWriter::new();
        w.push(0, 1);
        w.push(0, 3); // block type 0
        w.push_u24(1);

        let mut lzx = LzxDecoder::new(15).unwrap();
        assert!(matches!(
            lzx.decompress(&w.into_bytes(), 1),
            Err(Error::BlockType { value: 0, .. })
        ));
    }
}
