// GUID partition table decoder

use byteorder::{ByteOrder, LittleEndian};
use strata_core::block::BLOCK_TYPE_PARTITION;
use strata_core::{Block, BlockReader, Decoder, Result, StrataError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

const MIN_HEADER_SIZE: usize = 92;
const MIN_ENTRY_SIZE: usize = 128;
const MAX_ENTRY_SIZE: usize = 512;
/// Refuse absurd partition arrays from corrupt headers
const MAX_ENTRIES: u32 = 4096;

/// Parsed primary GPT header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub disk_guid: Uuid,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptPartition {
    /// 1-based slot in the partition array
    pub index: u32,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    /// Inclusive
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

/// Friendly name for well-known partition type GUIDs
pub fn type_name(type_guid: &Uuid) -> &'static str {
    match type_guid.to_string().to_uppercase().as_str() {
        "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => "EFI System",
        "E3C9E316-0B5C-4DB8-817D-F92DF00215AE" => "Microsoft Reserved",
        "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => "Basic Data",
        "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC" => "Windows Recovery",
        "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => "Linux Filesystem",
        "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F" => "Linux Swap",
        "E6D6D379-F507-44C2-A23C-238F2A3DF928" => "Linux LVM",
        "48465300-0000-11AA-AA11-00306543ECAC" => "Apple HFS+",
        "7C3457EF-0000-11AA-AA11-00306543ECAC" => "Apple APFS",
        _ => "Unknown",
    }
}

/// Parse and verify the header at LBA 1. `Ok(None)` when there is no GPT
/// signature, `Err(Corrupt)` when the signature is present but the header
/// does not check out.
pub fn read_header(reader: &BlockReader) -> Result<Option<GptHeader>> {
    if reader.size() < 2 * SECTOR_SIZE {
        return Ok(None);
    }
    let sector = reader.read_vec_at(SECTOR_SIZE, SECTOR_SIZE as usize)?;
    if &sector[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let header_size = LittleEndian::read_u32(&sector[12..16]) as usize;
    if !(MIN_HEADER_SIZE..=SECTOR_SIZE as usize).contains(&header_size) {
        return Err(StrataError::Corrupt(format!("GPT header size {}", header_size)));
    }
    let stored_crc = LittleEndian::read_u32(&sector[16..20]);
    let mut header = sector[..header_size].to_vec();
    header[16..20].fill(0);
    let actual_crc = crc32fast::hash(&header);
    if stored_crc != actual_crc {
        return Err(StrataError::Corrupt(format!(
            "GPT header CRC mismatch: stored {:08X}, computed {:08X}",
            stored_crc, actual_crc
        )));
    }

    let mut guid = [0u8; 16];
    guid.copy_from_slice(&sector[56..72]);
    let parsed = GptHeader {
        disk_guid: Uuid::from_bytes_le(guid),
        first_usable_lba: LittleEndian::read_u64(&sector[40..48]),
        last_usable_lba: LittleEndian::read_u64(&sector[48..56]),
        entries_lba: LittleEndian::read_u64(&sector[72..80]),
        entry_count: LittleEndian::read_u32(&sector[80..84]),
        entry_size: LittleEndian::read_u32(&sector[84..88]),
    };
    let entry_size = parsed.entry_size as usize;
    if !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&entry_size) || entry_size % 8 != 0 {
        return Err(StrataError::Corrupt(format!("GPT entry size {}", parsed.entry_size)));
    }
    if parsed.entry_count > MAX_ENTRIES {
        return Err(StrataError::Corrupt(format!("GPT entry count {}", parsed.entry_count)));
    }

    // Partition array checksum lives in the header too
    let array_crc = LittleEndian::read_u32(&sector[88..92]);
    let array = read_entry_array(reader, &parsed)?;
    let computed = crc32fast::hash(&array);
    if array_crc != computed {
        return Err(StrataError::Corrupt(format!(
            "GPT partition array CRC mismatch: stored {:08X}, computed {:08X}",
            array_crc, computed
        )));
    }
    Ok(Some(parsed))
}

fn read_entry_array(reader: &BlockReader, header: &GptHeader) -> Result<Vec<u8>> {
    let length = (header.entry_count as usize)
        .checked_mul(header.entry_size as usize)
        .ok_or_else(|| StrataError::Corrupt("GPT partition array size overflows".to_string()))?;
    let offset = header
        .entries_lba
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| StrataError::Corrupt(format!("GPT entries LBA {}", header.entries_lba)))?;
    if length as u64 > reader.size().saturating_sub(offset) {
        return Err(StrataError::Corrupt(format!(
            "GPT partition array of {} bytes at LBA {} exceeds the disk",
            length, header.entries_lba
        )));
    }
    reader.read_vec_at(offset, length)
}

/// Byte range of a partition, `None` when it ends before it starts or
/// does not fit in 64 bits
fn byte_range(partition: &GptPartition) -> Option<(u64, u64)> {
    let sectors = partition
        .last_lba
        .checked_sub(partition.first_lba)?
        .checked_add(1)?;
    let offset = partition.first_lba.checked_mul(SECTOR_SIZE)?;
    let size = sectors.checked_mul(SECTOR_SIZE)?;
    offset.checked_add(size)?;
    Some((offset, size))
}

/// Used entries of the partition array
pub fn read_partitions(reader: &BlockReader, header: &GptHeader) -> Result<Vec<GptPartition>> {
    let array = read_entry_array(reader, header)?;
    let mut partitions = Vec::new();

    for (slot, entry) in array.chunks_exact(header.entry_size as usize).enumerate() {
        let mut type_bytes = [0u8; 16];
        type_bytes.copy_from_slice(&entry[0..16]);
        let type_guid = Uuid::from_bytes_le(type_bytes);
        if type_guid.is_nil() {
            continue;
        }
        let mut unique_bytes = [0u8; 16];
        unique_bytes.copy_from_slice(&entry[16..32]);

        let units: Vec<u16> = entry[56..128]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();

        partitions.push(GptPartition {
            index: slot as u32 + 1,
            type_guid,
            unique_guid: Uuid::from_bytes_le(unique_bytes),
            first_lba: LittleEndian::read_u64(&entry[32..40]),
            last_lba: LittleEndian::read_u64(&entry[40..48]),
            attributes: LittleEndian::read_u64(&entry[48..56]),
            name: String::from_utf16_lossy(&units),
        });
    }
    Ok(partitions)
}

/// Emits one "partition" block per used GPT entry
pub struct GptDecoder;

impl Decoder for GptDecoder {
    fn name(&self) -> &str {
        "gpt"
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        if !block.is_disk() {
            return Ok(false);
        }
        let reader = block.new_reader();
        let Some(header) = read_header(&reader)? else {
            return Ok(false);
        };

        for partition in read_partitions(&reader, &header)? {
            let Some((offset, size)) = byte_range(&partition) else {
                warn!(
                    uid = block.uid(),
                    index = partition.index,
                    first_lba = partition.first_lba,
                    last_lba = partition.last_lba,
                    "GPT entry has an impossible LBA range, skipped"
                );
                continue;
            };
            let child = match Block::slice(block, offset, size, BLOCK_TYPE_PARTITION) {
                Ok(child) => child,
                Err(e) => {
                    warn!(uid = block.uid(), index = partition.index, error = %e, "Partition exceeds the disk, skipped");
                    continue;
                }
            };
            new_blocks.push(
                child
                    .with_attribute("partition.scheme", "gpt")
                    .with_attribute("partition.index", partition.index)
                    .with_attribute("partition.type_guid", partition.type_guid.to_string())
                    .with_attribute("partition.type_name", type_name(&partition.type_guid))
                    .with_attribute("partition.guid", partition.unique_guid.to_string())
                    .with_attribute("partition.name", partition.name)
                    .with_attribute("partition.start_lba", partition.first_lba)
                    .with_attribute("partition.flags", partition.attributes)
                    .with_attribute("gpt.disk_guid", header.disk_guid.to_string()),
            );
        }
        debug!(uid = block.uid(), partitions = new_blocks.len(), "GPT decoded");
        Ok(true)
    }
}
