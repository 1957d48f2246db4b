//! STFS (LIVE/PIRS) package traversal.
//!
//! The container is FAT-like: a table of 64-byte entries describes files and
//! directories, and file contents are read cluster by cluster with the hash
//! pages that interleave the data every 170 clusters skipped over.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const ENTRY_SIZE: usize = 64;
const CLUSTER_SIZE: u64 = 0x1000;
/// The file table spans at most this many clusters.
const FILE_TABLE_MAX_CLUSTERS: u64 = 16;

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    /// Path relative to the package root, directory prefixes included.
    pub path: String,
    pub is_dir: bool,
    pub contiguous: bool,
    pub start_cluster: u32,
    pub cluster_count: u32,
    pub len: u32,
}

#[derive(Debug)]
pub struct Package {
    file: File,
    data_start: u64,
    hash_stride: u64,
    entries: Vec<Entry>,
}

impl Package {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != b"LIVE" && &magic != b"PIRS" {
            return Err(Error::BadMagic {
                expected: "LIVE or PIRS",
                found: magic,
            });
        }

        let file_len = file.metadata()?.len();
        if file_len < 0xD000 {
            return Err(Error::format(
                format!("package too small ({file_len} bytes)"),
                file_len,
            ));
        }

        file.seek(SeekFrom::Start(0xC032))?;
        let mut index = [0u8; 2];
        file.read_exact(&mut index)?;
        let (data_start, hash_stride) = if u16::from_be_bytes(index) == 0xFFFF {
            (0xC000, 0x1000)
        } else {
            (0xD000, 0x2000)
        };
        log::debug!("data start {data_start:#x}, hash stride {hash_stride:#x}");

        file.seek(SeekFrom::Start(data_start))?;
        let cap = (CLUSTER_SIZE * FILE_TABLE_MAX_CLUSTERS).min(file_len - data_start);
        let mut table = vec![0u8; cap as usize];
        file.read_exact(&mut table)?;

        let entries = parse_file_table(&table);
        log::debug!("{} file table entries", entries.len());

        Ok(Self {
            file,
            data_start,
            hash_stride,
            entries,
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Read one file's bytes, cluster by cluster.
    pub fn read_file(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        if entry.is_dir {
            return Err(Error::format(format!("{} is a directory", entry.path), 0));
        }
        if entry.start_cluster < 1 {
            return Err(Error::format(
                format!("{}: start cluster must be >= 1", entry.path),
                0,
            ));
        }

        let mut data = Vec::with_capacity(entry.len as usize);
        let mut cluster = entry.start_cluster;
        let mut linear = self.data_start + u64::from(entry.start_cluster) * CLUSTER_SIZE;
        let mut remaining = i64::from(entry.len);

        while remaining > 0 {
            let real = linear + cluster_shift(cluster, self.hash_stride);
            self.file.seek(SeekFrom::Start(real))?;
            let take = remaining.min(CLUSTER_SIZE as i64) as usize;
            let mut chunk = vec![0u8; take];
            self.file.read_exact(&mut chunk)?;
            data.extend_from_slice(&chunk);

            cluster += 1;
            linear += CLUSTER_SIZE;
            remaining -= CLUSTER_SIZE as i64;
        }

        Ok(data)
    }

    /// Extract every file under `dir`, creating directories as recorded.
    /// Returns the written paths in table order.
    pub fn extract_all(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let entries = self.entries.clone();
        let mut written = Vec::new();

        for entry in &entries {
            let target = dir.join(&entry.path);
            if entry.is_dir {
                fs::create_dir_all(&target)?;
                continue;
            }
            if entry.start_cluster < 1 {
                log::warn!("{}: start cluster 0, skipping", entry.path);
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let data = self.read_file(entry)?;
            fs::write(&target, &data)?;
            log::info!("extracted {} ({} bytes)", entry.path, data.len());
            written.push(target);
        }

        Ok(written)
    }
}

fn parse_file_table(table: &[u8]) -> Vec<Entry> {
    // Directory entries refer to their parent by table index; 0xFFFF is the
    // package root.
    let mut paths: HashMap<u16, String> = HashMap::new();
    paths.insert(0xFFFF, String::new());

    let mut entries = Vec::new();
    for (i, raw) in table.chunks_exact(ENTRY_SIZE).enumerate() {
        let flags = raw[40];
        let name_len = usize::from(flags & 0x3F);
        if name_len == 0 {
            break;
        }
        let is_dir = flags & 0x80 != 0;
        let contiguous = flags & 0x40 != 0;

        if name_len > 40 {
            log::warn!("entry {i}: name length {name_len} out of range, skipping");
            continue;
        }
        let name = String::from_utf8_lossy(&raw[..name_len]).into_owned();

        let count1 = le24(&raw[41..44]);
        let count2 = le24(&raw[44..47]);
        if count1 != count2 {
            log::warn!("{name}: duplicated cluster counts differ ({count1} != {count2})");
        }
        let start_cluster = le24(&raw[47..50]);
        let parent = u16::from_be_bytes([raw[50], raw[51]]);
        let len = u32::from_be_bytes([raw[52], raw[53], raw[54], raw[55]]);

        let parent_path = paths.get(&parent).cloned().unwrap_or_default();
        let path = format!("{parent_path}{name}");
        if is_dir {
            paths.insert(i as u16, format!("{path}/"));
        }

        entries.push(Entry {
            name,
            path,
            is_dir,
            contiguous,
            start_cluster,
            cluster_count: count1,
            len,
        });
    }
    entries
}

fn le24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16)
}

/// Extra bytes to skip for the hash pages preceding `cluster`, applied
/// recursively for every level of the hash hierarchy.
fn cluster_shift(mut cluster: u32, stride: u64) -> u64 {
    let mut shift = 0;
    while cluster >= 170 {
        cluster /= 170;
        shift += (u64::from(cluster) + 1) * stride;
    }
    shift
}
