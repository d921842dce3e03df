// Filesystem detection by boot sector and superblock signatures

use crate::fat::BiosParameterBlock;
use byteorder::{ByteOrder, LittleEndian};
use strata_core::block::{BLOCK_TYPE_DISK, BLOCK_TYPE_FILESYSTEM, BLOCK_TYPE_PARTITION};
use strata_core::{Block, BlockReader, Decoder, Result, ATTR_FS_IMPLEMENTATION};
use tracing::debug;

pub const FS_NTFS: &str = "ntfs";
pub const FS_EXFAT: &str = "exfat";
pub const FS_EXT2: &str = "ext2";
pub const FS_EXT3: &str = "ext3";
pub const FS_EXT4: &str = "ext4";

/// Offset of the ext superblock inside the volume
pub const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT_MAGIC: u16 = 0xEF53;

const EXT_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_INCOMPAT_64BIT: u32 = 0x0080;
const EXT_INCOMPAT_FLEX_BG: u32 = 0x0200;

/// Block types the signature decoder inspects
const CANDIDATE_TYPES: &[&str] = &[BLOCK_TYPE_DISK, BLOCK_TYPE_PARTITION, "volume"];

/// A recognised filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub implementation: &'static str,
    pub label: Option<String>,
}

/// Identify the filesystem starting at the beginning of `reader`
pub fn detect(reader: &BlockReader) -> Result<Option<Detection>> {
    if reader.size() < 512 {
        return Ok(None);
    }
    let boot = reader.read_vec_at(0, 512)?;
    if let Some(detection) = detect_boot_sector(&boot) {
        return Ok(Some(detection));
    }

    if reader.size() >= EXT_SUPERBLOCK_OFFSET + 1024 {
        let superblock = reader.read_vec_at(EXT_SUPERBLOCK_OFFSET, 1024)?;
        if let Some(detection) = detect_ext(&superblock) {
            return Ok(Some(detection));
        }
    }
    Ok(None)
}

/// Filesystems identified by their first sector alone
pub fn detect_boot_sector(boot: &[u8]) -> Option<Detection> {
    if boot.len() < 512 {
        return None;
    }
    match &boot[3..11] {
        b"NTFS    " => {
            return Some(Detection {
                implementation: FS_NTFS,
                label: None,
            })
        }
        b"EXFAT   " => {
            return Some(Detection {
                implementation: FS_EXFAT,
                label: None,
            })
        }
        _ => {}
    }

    BiosParameterBlock::parse(boot).map(|bpb| Detection {
        implementation: bpb.fat_type().implementation(),
        label: bpb.volume_label.clone(),
    })
}

fn detect_ext(superblock: &[u8]) -> Option<Detection> {
    if LittleEndian::read_u16(&superblock[56..58]) != EXT_MAGIC {
        return None;
    }
    let compat = LittleEndian::read_u32(&superblock[92..96]);
    let incompat = LittleEndian::read_u32(&superblock[96..100]);

    let implementation = if incompat & (EXT_INCOMPAT_EXTENTS | EXT_INCOMPAT_64BIT | EXT_INCOMPAT_FLEX_BG) != 0 {
        FS_EXT4
    } else if compat & EXT_COMPAT_HAS_JOURNAL != 0 {
        FS_EXT3
    } else {
        FS_EXT2
    };

    let name = &superblock[120..136];
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let label = String::from_utf8_lossy(&name[..end]).trim().to_string();
    Some(Detection {
        implementation,
        label: (!label.is_empty()).then_some(label),
    })
}

/// Wraps a recognised filesystem in a "filesystem" child block spanning
/// the whole candidate
pub struct FilesystemSignatureDecoder;

impl Decoder for FilesystemSignatureDecoder {
    fn name(&self) -> &str {
        "fs-signature"
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        if !CANDIDATE_TYPES.iter().any(|t| *t == block.block_type()) {
            return Ok(false);
        }
        let Some(detection) = detect(&block.new_reader())? else {
            return Ok(false);
        };

        debug!(
            uid = block.uid(),
            implementation = detection.implementation,
            label = ?detection.label,
            "Filesystem signature found"
        );
        let mut filesystem = Block::slice(block, 0, block.size(), BLOCK_TYPE_FILESYSTEM)?
            .with_attribute(ATTR_FS_IMPLEMENTATION, detection.implementation);
        if let Some(label) = detection.label {
            filesystem.set_attribute("fs.label", label);
        }
        new_blocks.push(filesystem);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::test_utils::memory_reader;

    fn superblock_image(compat: u32, incompat: u32, label: &str) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        let sb = EXT_SUPERBLOCK_OFFSET as usize;
        data[sb + 56..sb + 58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        data[sb + 92..sb + 96].copy_from_slice(&compat.to_le_bytes());
        data[sb + 96..sb + 100].copy_from_slice(&incompat.to_le_bytes());
        data[sb + 120..sb + 120 + label.len()].copy_from_slice(label.as_bytes());
        data
    }

    #[test]
    fn test_detects_ext_generations() {
        let ext2 = detect(&memory_reader(superblock_image(0, 0, ""))).unwrap().unwrap();
        assert_eq!(ext2.implementation, FS_EXT2);
        assert_eq!(ext2.label, None);

        let ext3 = detect(&memory_reader(superblock_image(EXT_COMPAT_HAS_JOURNAL, 0, "root")))
            .unwrap()
            .unwrap();
        assert_eq!(ext3.implementation, FS_EXT3);
        assert_eq!(ext3.label.as_deref(), Some("root"));

        let ext4 = detect(&memory_reader(superblock_image(
            EXT_COMPAT_HAS_JOURNAL,
            EXT_INCOMPAT_EXTENTS,
            "data",
        )))
        .unwrap()
        .unwrap();
        assert_eq!(ext4.implementation, FS_EXT4);
    }

    #[test]
    fn test_detects_oem_signatures() {
        let mut boot = vec![0u8; 512];
        boot[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(detect_boot_sector(&boot).unwrap().implementation, FS_NTFS);
        boot[3..11].copy_from_slice(b"EXFAT   ");
        assert_eq!(detect_boot_sector(&boot).unwrap().implementation, FS_EXFAT);
    }

    #[test]
    fn test_blank_and_short_content() {
        assert_eq!(detect(&memory_reader(vec![0u8; 8192])).unwrap(), None);
        assert_eq!(detect(&memory_reader(vec![0u8; 100])).unwrap(), None);
    }
}
