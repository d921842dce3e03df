// MBR partition table decoder, including logical partitions in
// extended partitions

use crate::signature::detect_boot_sector;
use byteorder::{ByteOrder, LittleEndian};
use strata_core::block::BLOCK_TYPE_PARTITION;
use strata_core::{Block, BlockReader, Decoder, Result};
use tracing::{debug, warn};

pub const SECTOR_SIZE: u64 = 512;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const PROTECTIVE_TYPE: u8 = 0xEE;
/// Bound on the EBR chain, guards against loops
const MAX_LOGICAL_PARTITIONS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 1-4 for primary entries, 5 and up for logical ones
    pub number: u32,
    pub bootable: bool,
    pub partition_type: u8,
    /// Absolute start sector
    pub start_lba: u64,
    pub size_sectors: u64,
}

impl PartitionEntry {
    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F | 0x85)
    }
}

/// Human readable name of an MBR partition type
pub fn type_name(partition_type: u8) -> &'static str {
    match partition_type {
        0x00 => "Empty",
        0x01 => "FAT12",
        0x04 => "FAT16 (<32MB)",
        0x05 => "Extended",
        0x06 => "FAT16",
        0x07 => "NTFS/exFAT",
        0x0B => "FAT32 (CHS)",
        0x0C => "FAT32 (LBA)",
        0x0E => "FAT16 (LBA)",
        0x0F => "Extended (LBA)",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x85 => "Linux extended",
        0x8E => "Linux LVM",
        0xA5 => "FreeBSD",
        0xEE => "GPT Protective",
        0xEF => "EFI System",
        _ => "Unknown",
    }
}

/// Raw entries of one partition sector, `None` without a valid table
fn parse_table(sector: &[u8]) -> Option<Vec<(bool, u8, u32, u32)>> {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    let mut entries = Vec::with_capacity(4);
    for i in 0..4 {
        let entry = &sector[TABLE_OFFSET + i * ENTRY_SIZE..TABLE_OFFSET + (i + 1) * ENTRY_SIZE];
        if entry[0] != 0x00 && entry[0] != 0x80 {
            return None;
        }
        entries.push((
            entry[0] == 0x80,
            entry[4],
            LittleEndian::read_u32(&entry[8..12]),
            LittleEndian::read_u32(&entry[12..16]),
        ));
    }
    Some(entries)
}

/// Parse the partition table of a disk-like reader.
///
/// Returns `None` when sector 0 is no MBR, is a GPT protective MBR or is
/// really a filesystem boot sector.
pub fn read_partitions(reader: &BlockReader) -> Result<Option<Vec<PartitionEntry>>> {
    if reader.size() < SECTOR_SIZE {
        return Ok(None);
    }
    let sector = reader.read_vec_at(0, SECTOR_SIZE as usize)?;
    if detect_boot_sector(&sector).is_some() {
        return Ok(None);
    }
    let Some(raw) = parse_table(&sector) else {
        return Ok(None);
    };
    if raw.iter().any(|(_, t, _, _)| *t == PROTECTIVE_TYPE) {
        debug!("Protective MBR, leaving the disk to GPT");
        return Ok(None);
    }

    let mut partitions = Vec::new();
    for (i, (bootable, partition_type, start, count)) in raw.into_iter().enumerate() {
        if partition_type == 0 || count == 0 {
            continue;
        }
        partitions.push(PartitionEntry {
            number: i as u32 + 1,
            bootable,
            partition_type,
            start_lba: start as u64,
            size_sectors: count as u64,
        });
    }
    if partitions.is_empty() {
        return Ok(None);
    }

    let extended: Vec<PartitionEntry> = partitions.iter().filter(|p| p.is_extended()).cloned().collect();
    for container in extended {
        partitions.extend(read_logical_partitions(reader, &container, 5)?);
    }
    Ok(Some(partitions))
}

/// Walk the EBR chain of an extended partition
fn read_logical_partitions(
    reader: &BlockReader,
    container: &PartitionEntry,
    first_number: u32,
) -> Result<Vec<PartitionEntry>> {
    let mut logical = Vec::new();
    let mut ebr_lba = container.start_lba;
    let mut visited = Vec::new();

    while logical.len() < MAX_LOGICAL_PARTITIONS {
        if visited.contains(&ebr_lba) || (ebr_lba + 1) * SECTOR_SIZE > reader.size() {
            warn!(ebr_lba, "EBR chain leaves the disk or loops, stopping");
            break;
        }
        visited.push(ebr_lba);

        let sector = reader.read_vec_at(ebr_lba * SECTOR_SIZE, SECTOR_SIZE as usize)?;
        let Some(raw) = parse_table(&sector) else {
            warn!(ebr_lba, "Invalid EBR signature");
            break;
        };

        let (bootable, partition_type, start, count) = raw[0];
        if partition_type != 0 && count != 0 {
            logical.push(PartitionEntry {
                number: first_number + logical.len() as u32,
                bootable,
                partition_type,
                start_lba: ebr_lba + start as u64,
                size_sectors: count as u64,
            });
        }

        // Second entry links to the next EBR, relative to the container
        let (_, next_type, next_start, _) = raw[1];
        if next_type == 0 || next_start == 0 {
            break;
        }
        ebr_lba = container.start_lba + next_start as u64;
    }
    Ok(logical)
}

/// Emits one "partition" block per primary and logical partition
pub struct MbrDecoder;

impl Decoder for MbrDecoder {
    fn name(&self) -> &str {
        "mbr"
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        if !block.is_disk() {
            return Ok(false);
        }
        let Some(partitions) = read_partitions(&block.new_reader())? else {
            return Ok(false);
        };

        for partition in partitions {
            if partition.is_extended() {
                continue;
            }
            let offset = partition.start_lba * SECTOR_SIZE;
            let size = partition.size_sectors * SECTOR_SIZE;
            let child = match Block::slice(block, offset, size, BLOCK_TYPE_PARTITION) {
                Ok(child) => child,
                Err(e) => {
                    warn!(
                        uid = block.uid(),
                        number = partition.number,
                        error = %e,
                        "Partition exceeds the disk, skipped"
                    );
                    continue;
                }
            };
            new_blocks.push(
                child
                    .with_attribute("partition.scheme", "mbr")
                    .with_attribute("partition.index", partition.number)
                    .with_attribute("partition.type", partition.partition_type)
                    .with_attribute("partition.type_name", type_name(partition.partition_type))
                    .with_attribute("partition.bootable", partition.bootable)
                    .with_attribute("partition.start_lba", partition.start_lba),
            );
        }
        debug!(uid = block.uid(), partitions = new_blocks.len(), "MBR decoded");
        Ok(true)
    }
}
