//! Recovery of `bctr`-dispatched switch tables from a flat PE image.
//!
//! The compiler ends every table dispatch with the same three-instruction
//! epilogue; everything else (table address, base address, entry width, index
//! register, entry count) is reconstructed by walking backward from it. The
//! walk is a fixed sequence of pattern searches over a small register subset,
//! with `nop`s skipped throughout.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::ppc::{
    Insn, OP_ADDI, OP_ADDIS, OP_BC, OP_BCLR_GROUP, OP_CMPI, OP_CMPLI, OP_EXT31, OP_RLWINM,
    XO_BCLR, XO_LBZX, XO_LHZX,
};

/// Load address of the PE image; file offset 0 maps here.
pub const IMAGE_BASE: u32 = 0x8200_0000;
/// Exclusive end of the code range dispatch targets may point into.
pub const CODE_END: u32 = 0x8230_0000;

/// add r12, r12, r0
const ADD_R12_R12_R0: u32 = 0x7D8C_0214;
/// mtctr r12
const MTCTR_R12: u32 = 0x7D89_03A6;
/// bctr
const BCTR: u32 = 0x4E80_0420;

/// Cap on the fallback probe that sizes a table from its own contents.
const PROBE_MAX_ENTRIES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWidth {
    Byte,
    Half,
}

impl EntryWidth {
    pub fn bytes(self) -> usize {
        match self {
            EntryWidth::Byte => 1,
            EntryWidth::Half => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryWidth::Byte => "u8",
            EntryWidth::Half => "u16",
        }
    }
}

/// A fully recovered dispatch site.
#[derive(Debug, Clone)]
pub struct SwitchTable {
    pub bctr_addr: u32,
    pub index_reg: u32,
    pub table_addr: u32,
    pub base_addr: u32,
    pub entry_width: EntryWidth,
    pub entry_scale: u32,
    pub labels: Vec<u32>,
}

/// Per-site result; misses do not stop the scan.
#[derive(Debug, Clone)]
pub enum SiteOutcome {
    Recovered(SwitchTable),
    Miss { bctr_addr: u32, reason: String },
}

impl SiteOutcome {
    pub fn bctr_addr(&self) -> u32 {
        match self {
            SiteOutcome::Recovered(table) => table.bctr_addr,
            SiteOutcome::Miss { bctr_addr, .. } => *bctr_addr,
        }
    }
}

/// Manual corrections for sites the heuristics get wrong. These are data, not
/// code: they differ per game and come from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanConfig {
    /// `bctr` addresses to skip entirely (targets in another function).
    #[serde(default)]
    pub exclude: Vec<u32>,
    /// Explicit entry counts where the bound search underestimates.
    #[serde(default)]
    pub size: Vec<SizeOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizeOverride {
    pub bctr: u32,
    pub entries: usize,
}

impl ScanConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    fn excluded(&self) -> HashSet<u32> {
        self.exclude.iter().copied().collect()
    }

    fn size_overrides(&self) -> HashMap<u32, usize> {
        self.size.iter().map(|o| (o.bctr, o.entries)).collect()
    }
}

/// Scan `image` for dispatch epilogues and recover each site.
pub fn scan_image(image: &[u8], config: &ScanConfig) -> Vec<SiteOutcome> {
    let excluded = config.excluded();
    let overrides = config.size_overrides();
    let mut outcomes = Vec::new();

    let mut off = 0usize;
    while off + 12 <= image.len() {
        let epilogue = word(image, off as i64).map(|i| i.0) == Some(ADD_R12_R12_R0)
            && word(image, off as i64 + 4).map(|i| i.0) == Some(MTCTR_R12)
            && word(image, off as i64 + 8).map(|i| i.0) == Some(BCTR);
        if !epilogue {
            off += 4;
            continue;
        }

        let bctr_addr = IMAGE_BASE + (off as u32 + 8);
        if !(IMAGE_BASE..CODE_END).contains(&bctr_addr) {
            off += 4;
            continue;
        }
        if excluded.contains(&bctr_addr) {
            log::debug!("skipping excluded bctr at {bctr_addr:#010x}");
            off += 12;
            continue;
        }

        let outcome = match recover_site(image, off as i64) {
            Ok(mut geometry) => {
                if let Some(&entries) = overrides.get(&bctr_addr) {
                    log::debug!("size override at {bctr_addr:#010x}: {entries} entries");
                    geometry.size = entries;
                }
                match read_labels(image, &geometry) {
                    Ok(labels) => SiteOutcome::Recovered(SwitchTable {
                        bctr_addr,
                        index_reg: geometry.index_reg,
                        table_addr: geometry.table_addr,
                        base_addr: geometry.base_addr,
                        entry_width: geometry.entry_width,
                        entry_scale: geometry.entry_scale,
                        labels,
                    }),
                    Err(reason) => SiteOutcome::Miss { bctr_addr, reason },
                }
            }
            Err(reason) => SiteOutcome::Miss { bctr_addr, reason },
        };

        if let SiteOutcome::Miss { ref reason, .. } = outcome {
            log::warn!("unrecoverable switch at {bctr_addr:#010x}: {reason}");
        }
        outcomes.push(outcome);
        off += 12;
    }

    outcomes
}

struct Geometry {
    table_addr: u32,
    base_addr: u32,
    entry_width: EntryWidth,
    entry_scale: u32,
    index_reg: u32,
    size: usize,
}

fn word(image: &[u8], off: i64) -> Option<Insn> {
    if off < 0 {
        return None;
    }
    let off = off as usize;
    let bytes = image.get(off..off + 4)?;
    Some(Insn(u32::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3],
    ])))
}

/// `lis r12 / addi r12, r12` pair ending just before `anchor`. The strict
/// walk stops at the first foreign instruction (only `nop` is transparent);
/// the lenient walk also steps over `rlwinm` and anything else in the window.
fn addr_pair(
    image: &[u8],
    anchor: i64,
    outer_window: i64,
    inner_window: i64,
    lenient: bool,
) -> Option<(u32, i64)> {
    let mut i = anchor - 4;
    while i >= anchor - outer_window {
        let d = word(image, i)?;
        if d.opcode() == OP_ADDI && d.rd() == 12 && d.ra() == 12 {
            let addi_val = i64::from(d.simm());
            let mut j = i - 4;
            while j >= i - inner_window {
                let d2 = word(image, j)?;
                if d2.opcode() == OP_ADDIS && d2.rd() == 12 && d2.ra() == 0 {
                    let lis_val = i64::from(d2.uimm() as u16 as i16) << 16;
                    return Some(((lis_val + addi_val) as u32, j));
                }
                if d2.is_nop() || lenient {
                    j -= 4;
                    continue;
                }
                break;
            }
            return None;
        }
        if d.is_nop() || lenient {
            i -= 4;
            continue;
        }
        return None;
    }
    None
}

fn recover_site(image: &[u8], add_off: i64) -> std::result::Result<Geometry, String> {
    // Base address: the lis/addi pair closest to the add.
    let (base_addr, base_lis_off) = addr_pair(image, add_off, 48, 24, false)
        .ok_or_else(|| "no base address computation before the dispatch".to_string())?;

    // Table load: lhzx (half-word entries) or lbzx (byte entries) into r0.
    let mut load = None;
    let mut i = base_lis_off - 4;
    while i >= base_lis_off - 48 {
        if let Some(d) = word(image, i) {
            if d.opcode() == OP_EXT31 && d.rd() == 0 && d.ra() == 12 {
                if d.xo() == XO_LHZX {
                    load = Some((EntryWidth::Half, d.rb(), i));
                    break;
                }
                if d.xo() == XO_LBZX {
                    load = Some((EntryWidth::Byte, d.rb(), i));
                    break;
                }
            }
        }
        i -= 4;
    }
    let (entry_width, load_index_reg, load_off) =
        load.ok_or_else(|| "no table load before the base computation".to_string())?;

    // Byte tables may scale the loaded entry by four between load and add.
    let mut entry_scale = 1;
    if entry_width == EntryWidth::Byte {
        let mut k = load_off + 4;
        while k < add_off {
            if let Some(d) = word(image, k) {
                if d.opcode() == OP_RLWINM
                    && d.rd() == 0
                    && d.ra() == 0
                    && d.sh() == 2
                    && d.mb() == 0
                    && d.me() == 29
                {
                    entry_scale = 4;
                    break;
                }
            }
            k += 4;
        }
    }

    // Table address: the earlier lis/addi pair feeding the load.
    let (table_addr, table_lis_off) = addr_pair(image, load_off, 48, 40, true)
        .ok_or_else(|| "no table address computation before the load".to_string())?;

    // Half-word tables scale the index by two before the load; the rotate's
    // source register is the real switch index.
    let mut index_reg = load_index_reg;
    if entry_width == EntryWidth::Half {
        let mut k = load_off - 4;
        while k >= table_lis_off {
            if let Some(d) = word(image, k) {
                if d.opcode() == OP_RLWINM
                    && d.ra() == load_index_reg
                    && d.sh() == 1
                    && d.mb() == 0
                    && d.me() == 30
                {
                    index_reg = d.rd();
                    break;
                }
            }
            k -= 4;
        }
    }

    let size = match find_bound(image, table_lis_off, index_reg) {
        Some(size) => size,
        None => probe_table_size(image, table_addr, base_addr, entry_width, entry_scale),
    };

    Ok(Geometry {
        table_addr,
        base_addr,
        entry_width,
        entry_scale,
        index_reg,
        size,
    })
}

/// Bound inference: the first compare-and-branch against the index register
/// wins; a `clrlwi`-style mask is kept as a fallback only.
fn find_bound(image: &[u8], search_start: i64, index_reg: u32) -> Option<usize> {
    let stop = (search_start - 400).max(0);
    let mut mask_bound = None;

    let mut k = search_start - 4;
    while k > stop {
        let Some(d) = word(image, k) else {
            break;
        };

        if d.opcode() == OP_RLWINM
            && d.sh() == 0
            && d.me() == 31
            && (d.ra() == index_reg || d.rd() == index_reg)
        {
            if mask_bound.is_none() {
                mask_bound = Some(1usize << (32 - d.mb()));
            }
            k -= 4;
            continue;
        }

        if d.opcode() == OP_CMPLI && d.ra() == index_reg {
            match branch_condition(image, k + 4) {
                Some(BoundKind::Gt) => return Some(d.uimm() as usize + 1),
                Some(BoundKind::Ge) => return Some(d.uimm() as usize),
                None => {}
            }
        }

        if d.opcode() == OP_CMPI && d.ra() == index_reg && d.simm() >= 0 {
            match branch_condition(image, k + 4) {
                Some(BoundKind::Gt) => return Some(d.simm() as usize + 1),
                Some(BoundKind::Ge) => return Some(d.simm() as usize),
                None => {}
            }
        }

        k -= 4;
    }

    mask_bound
}

enum BoundKind {
    Gt,
    Ge,
}

/// `bgt`/`bgtlr` or `bge`/`bgelr` immediately after a compare.
fn branch_condition(image: &[u8], off: i64) -> Option<BoundKind> {
    let d = word(image, off)?;
    let is_branch =
        d.opcode() == OP_BC || (d.opcode() == OP_BCLR_GROUP && d.xo() == XO_BCLR);
    if !is_branch {
        return None;
    }
    match d.bi() & 3 {
        1 if d.bo() & 0x0C == 0x0C => Some(BoundKind::Gt),
        0 if d.bo() & 0x0C == 0x04 => Some(BoundKind::Ge),
        _ => None,
    }
}

/// Last resort: read entries until one stops looking like a code address.
fn probe_table_size(
    image: &[u8],
    table_addr: u32,
    base_addr: u32,
    entry_width: EntryWidth,
    entry_scale: u32,
) -> usize {
    let Some(table_off) = table_addr.checked_sub(IMAGE_BASE) else {
        return 1;
    };
    let table_off = table_off as usize;

    let mut size = 0;
    for idx in 0..PROBE_MAX_ENTRIES {
        let Some(entry) = read_entry(image, table_off, idx, entry_width) else {
            break;
        };
        let target = base_addr.wrapping_add(entry.wrapping_mul(entry_scale));
        if !(IMAGE_BASE..CODE_END).contains(&target) || target % 4 != 0 {
            break;
        }
        size = idx + 1;
    }
    size.max(1)
}

fn read_entry(image: &[u8], table_off: usize, idx: usize, width: EntryWidth) -> Option<u32> {
    match width {
        EntryWidth::Half => {
            let off = table_off + idx * 2;
            let bytes = image.get(off..off + 2)?;
            Some(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        EntryWidth::Byte => image.get(table_off + idx).map(|&b| u32::from(b)),
    }
}

fn read_labels(image: &[u8], geometry: &Geometry) -> std::result::Result<Vec<u32>, String> {
    let table_off = geometry
        .table_addr
        .checked_sub(IMAGE_BASE)
        .ok_or_else(|| format!("table address {:#010x} below the image", geometry.table_addr))?
        as usize;

    let mut labels = Vec::with_capacity(geometry.size);
    for idx in 0..geometry.size {
        let entry = read_entry(image, table_off, idx, geometry.entry_width)
            .ok_or_else(|| "jump table runs past the end of the image".to_string())?;
        labels.push(
            geometry
                .base_addr
                .wrapping_add(entry.wrapping_mul(geometry.entry_scale)),
        );
    }
    Ok(labels)
}
