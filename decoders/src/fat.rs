// FAT12/16/32 boot sector parsing and a root directory view

use byteorder::{ByteOrder, LittleEndian};
use strata_core::{BlockReader, DirectoryEntry, FilesystemInfo, FilesystemView, Result, StrataError};
use tracing::debug;

const DIR_ENTRY_SIZE: usize = 32;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Implementation tag used on filesystem blocks
    pub fn implementation(&self) -> &'static str {
        match self {
            FatType::Fat12 => "fat12",
            FatType::Fat16 => "fat16",
            FatType::Fat32 => "fat32",
        }
    }

    fn end_of_chain(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }
}

/// Fields of the BIOS parameter block needed to walk the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub root_entries: u32,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    /// First cluster of the root directory (FAT32 only)
    pub root_cluster: u32,
    pub volume_id: Option<u32>,
    pub volume_label: Option<String>,
}

impl BiosParameterBlock {
    /// Parse a boot sector, `None` when it does not look like FAT
    pub fn parse(boot: &[u8]) -> Option<Self> {
        if boot.len() < 512 || boot[510] != 0x55 || boot[511] != 0xAA {
            return None;
        }
        if boot[0] != 0xEB && boot[0] != 0xE9 {
            return None;
        }

        let bytes_per_sector = LittleEndian::read_u16(&boot[0x0B..0x0D]) as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return None;
        }
        let sectors_per_cluster = boot[0x0D] as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return None;
        }
        let reserved_sectors = LittleEndian::read_u16(&boot[0x0E..0x10]) as u32;
        let num_fats = boot[0x10] as u32;
        if reserved_sectors == 0 || num_fats == 0 {
            return None;
        }

        let root_entries = LittleEndian::read_u16(&boot[0x11..0x13]) as u32;
        let total_16 = LittleEndian::read_u16(&boot[0x13..0x15]) as u32;
        let fat_16 = LittleEndian::read_u16(&boot[0x16..0x18]) as u32;
        let total_32 = LittleEndian::read_u32(&boot[0x20..0x24]);
        let fat_32 = LittleEndian::read_u32(&boot[0x24..0x28]);

        let total_sectors = if total_16 != 0 { total_16 } else { total_32 };
        let is_fat32 = fat_16 == 0;
        let sectors_per_fat = if is_fat32 { fat_32 } else { fat_16 };
        if total_sectors == 0 || sectors_per_fat == 0 {
            return None;
        }

        // Extended BPB location differs between FAT12/16 and FAT32
        let (signature_at, id_at, label_at) = if is_fat32 {
            (0x42, 0x43, 0x47)
        } else {
            (0x26, 0x27, 0x2B)
        };
        let has_extended = matches!(boot[signature_at], 0x28 | 0x29);
        let volume_id = has_extended.then(|| LittleEndian::read_u32(&boot[id_at..id_at + 4]));
        let volume_label = if boot[signature_at] == 0x29 {
            let label = String::from_utf8_lossy(&boot[label_at..label_at + 11])
                .trim_end()
                .to_string();
            (!label.is_empty() && label != "NO NAME").then_some(label)
        } else {
            None
        };

        // The data area has to start inside the volume
        let root_dir_sectors = (root_entries as u64 * DIR_ENTRY_SIZE as u64)
            .checked_add(bytes_per_sector as u64 - 1)?
            / bytes_per_sector as u64;
        let data_start = (num_fats as u64)
            .checked_mul(sectors_per_fat as u64)?
            .checked_add(reserved_sectors as u64)?
            .checked_add(root_dir_sectors)?;
        if data_start >= total_sectors as u64 {
            return None;
        }

        Some(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entries,
            total_sectors,
            sectors_per_fat,
            root_cluster: if is_fat32 {
                LittleEndian::read_u32(&boot[0x2C..0x30])
            } else {
                0
            },
            volume_id,
            volume_label,
        })
    }

    pub fn root_dir_sectors(&self) -> u64 {
        let bytes_per_sector = self.bytes_per_sector.max(1) as u64;
        (self.root_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(bytes_per_sector)
    }

    /// First sector after the FATs, where FAT12/16 keep the root directory
    pub fn root_dir_start(&self) -> u64 {
        self.reserved_sectors as u64 + self.num_fats as u64 * self.sectors_per_fat as u64
    }

    pub fn first_data_sector(&self) -> u64 {
        self.root_dir_start() + self.root_dir_sectors()
    }

    pub fn cluster_count(&self) -> u32 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.first_data_sector());
        (data_sectors / self.sectors_per_cluster.max(1) as u64) as u32
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector.saturating_mul(self.sectors_per_cluster)
    }

    /// FAT variant, decided by cluster count alone
    pub fn fat_type(&self) -> FatType {
        match self.cluster_count() {
            n if n < 4085 => FatType::Fat12,
            n if n < 65525 => FatType::Fat16,
            _ => FatType::Fat32,
        }
    }
}

/// Read-only FAT volume exposing its root directory
pub struct FatFilesystem {
    reader: BlockReader,
    offset: u64,
    bpb: BiosParameterBlock,
    fat_type: FatType,
}

impl FatFilesystem {
    pub fn open(reader: BlockReader, offset: u64) -> Result<Self> {
        let boot = reader.read_vec_at(offset, 512)?;
        let bpb = BiosParameterBlock::parse(&boot)
            .ok_or_else(|| StrataError::Corrupt("no valid FAT boot sector".to_string()))?;
        let fat_type = bpb.fat_type();

        debug!(
            fat_type = fat_type.implementation(),
            bytes_per_sector = bpb.bytes_per_sector,
            sectors_per_cluster = bpb.sectors_per_cluster,
            clusters = bpb.cluster_count(),
            "Opened FAT volume"
        );

        Ok(Self {
            reader,
            offset,
            bpb,
            fat_type,
        })
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    fn sector_offset(&self, sector: u64) -> u64 {
        self.offset + sector * self.bpb.bytes_per_sector as u64
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        let sector = self.bpb.first_data_sector()
            + (cluster as u64 - 2) * self.bpb.sectors_per_cluster as u64;
        self.sector_offset(sector)
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster < 2 || cluster as u64 >= self.bpb.cluster_count() as u64 + 2 {
            return Err(StrataError::Corrupt(format!("invalid cluster {}", cluster)));
        }
        Ok(())
    }

    /// Successor of `cluster` in the first FAT, `None` at end of chain
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
        let fat_start = self.sector_offset(self.bpb.reserved_sectors as u64);
        let next = match self.fat_type {
            FatType::Fat12 => {
                let raw = self.reader.read_vec_at(fat_start + (cluster + cluster / 2) as u64, 2)?;
                let value = LittleEndian::read_u16(&raw) as u32;
                if cluster % 2 == 1 {
                    value >> 4
                } else {
                    value & 0x0FFF
                }
            }
            FatType::Fat16 => {
                let raw = self.reader.read_vec_at(fat_start + cluster as u64 * 2, 2)?;
                LittleEndian::read_u16(&raw) as u32
            }
            FatType::Fat32 => {
                let raw = self.reader.read_vec_at(fat_start + cluster as u64 * 4, 4)?;
                LittleEndian::read_u32(&raw) & 0x0FFF_FFFF
            }
        };

        if next >= self.fat_type.end_of_chain() {
            return Ok(None);
        }
        self.check_cluster(next)?;
        Ok(Some(next))
    }

    fn read_chain(&self, first: u32) -> Result<Vec<u8>> {
        let cluster_size = self.bpb.bytes_per_cluster() as usize;
        let limit = self.bpb.cluster_count() as usize;
        let mut data = Vec::new();
        let mut current = Some(first);
        let mut visited = 0usize;

        while let Some(cluster) = current {
            self.check_cluster(cluster)?;
            visited += 1;
            if visited > limit {
                return Err(StrataError::Corrupt(format!(
                    "cluster chain starting at {} does not terminate",
                    first
                )));
            }
            data.extend(self.reader.read_vec_at(self.cluster_offset(cluster), cluster_size)?);
            current = self.next_cluster(cluster)?;
        }
        Ok(data)
    }

    pub fn read_root_directory(&self) -> Result<Vec<DirectoryEntry>> {
        let data = match self.fat_type {
            FatType::Fat32 => self.read_chain(self.bpb.root_cluster)?,
            FatType::Fat12 | FatType::Fat16 => {
                // Fixed region between the FATs and the data area
                let start = self.bpb.root_dir_start();
                let size = self.bpb.root_dir_sectors() * self.bpb.bytes_per_sector as u64;
                debug!(offset = self.sector_offset(start), size, "Reading fixed root directory");
                self.reader.read_vec_at(self.sector_offset(start), size as usize)?
            }
        };
        Ok(parse_directory(&data))
    }
}

impl FilesystemView for FatFilesystem {
    fn filesystem_type(&self) -> &str {
        self.fat_type.implementation()
    }

    fn info(&self) -> FilesystemInfo {
        FilesystemInfo {
            filesystem_type: self.fat_type.implementation().to_string(),
            volume_label: self.bpb.volume_label.clone(),
            volume_serial: self
                .bpb
                .volume_id
                .map(|id| format!("{:04X}-{:04X}", id >> 16, id & 0xFFFF)),
            total_bytes: self.bpb.total_sectors as u64 * self.bpb.bytes_per_sector as u64,
            cluster_size: Some(self.bpb.bytes_per_cluster()),
        }
    }

    fn root_directory(&self) -> Result<Vec<DirectoryEntry>> {
        self.read_root_directory()
    }
}

/// Short-name entries of a directory. Deleted, long-name, volume label and
/// dot entries are skipped.
pub fn parse_directory(data: &[u8]) -> Vec<DirectoryEntry> {
    let mut entries = Vec::new();
    for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
        match raw[0] {
            0x00 => break,
            0xE5 => continue,
            _ => {}
        }
        let attributes = raw[11];
        if attributes & ATTR_LONG_NAME == ATTR_LONG_NAME || attributes & ATTR_VOLUME_ID != 0 {
            continue;
        }

        let name = short_name(&raw[..11]);
        if name == "." || name == ".." {
            continue;
        }

        let is_directory = attributes & ATTR_DIRECTORY != 0;
        entries.push(DirectoryEntry {
            name,
            size: if is_directory {
                0
            } else {
                LittleEndian::read_u32(&raw[28..32]) as u64
            },
            is_directory,
        });
    }
    entries
}

/// Render an 8.3 name as "NAME.EXT"
fn short_name(raw: &[u8]) -> String {
    let mut name = String::new();
    for (i, &b) in raw[..8].iter().enumerate() {
        if b == 0x20 || b == 0x00 {
            break;
        }
        // 0x05 stands for a leading 0xE5 byte
        if i == 0 && b == 0x05 {
            name.push(0xE5 as char);
        } else {
            name.push(b as char);
        }
    }

    let extension: String = raw[8..11]
        .iter()
        .take_while(|&&b| b != 0x20 && b != 0x00)
        .map(|&b| b as char)
        .collect();
    if !extension.is_empty() {
        name.push('.');
        name.push_str(&extension);
    }
    name
}
