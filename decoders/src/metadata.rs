// Metadata-only views for filesystems whose directories are not walked

use crate::signature::{EXT_MAGIC, EXT_SUPERBLOCK_OFFSET, FS_EXFAT, FS_EXT2, FS_EXT3, FS_EXT4, FS_NTFS};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::{BlockReader, DirectoryEntry, FilesystemInfo, FilesystemView, Result, StrataError};
use tracing::debug;

/// Exposes size, label and serial of a recognised filesystem.
/// Listing the root directory is not supported.
pub struct MetadataFilesystem {
    info: FilesystemInfo,
}

impl MetadataFilesystem {
    pub fn open(implementation: &str, reader: BlockReader, offset: u64) -> Result<Self> {
        let info = match implementation {
            FS_NTFS => read_ntfs(&reader, offset)?,
            FS_EXFAT => read_exfat(&reader, offset)?,
            FS_EXT2 | FS_EXT3 | FS_EXT4 => read_ext(implementation, &reader, offset)?,
            other => {
                return Err(StrataError::NotSupported(format!(
                    "no metadata reader for '{}'",
                    other
                )))
            }
        };
        debug!(
            filesystem = %info.filesystem_type,
            total_bytes = info.total_bytes,
            "Filesystem metadata read"
        );
        Ok(Self { info })
    }
}

fn read_ntfs(reader: &BlockReader, offset: u64) -> Result<FilesystemInfo> {
    let boot = reader.read_vec_at(offset, 512)?;
    if &boot[3..11] != b"NTFS    " {
        return Err(StrataError::Corrupt("missing NTFS OEM id".to_string()));
    }
    let bytes_per_sector = LittleEndian::read_u16(&boot[0x0B..0x0D]) as u64;
    let sectors_per_cluster = boot[0x0D] as u64;
    let total_sectors = LittleEndian::read_u64(&boot[0x28..0x30]);
    if bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return Err(StrataError::Corrupt("NTFS geometry is zero".to_string()));
    }
    // Serial is shown most significant byte first
    let mut serial = boot[0x48..0x50].to_vec();
    serial.reverse();

    let total_bytes = total_sectors.checked_mul(bytes_per_sector).ok_or_else(|| {
        StrataError::Corrupt(format!("NTFS sector total {} overflows", total_sectors))
    })?;

    Ok(FilesystemInfo {
        filesystem_type: FS_NTFS.to_string(),
        volume_label: None,
        volume_serial: Some(hex::encode_upper(serial)),
        total_bytes,
        cluster_size: Some((bytes_per_sector * sectors_per_cluster) as u32),
    })
}

fn read_exfat(reader: &BlockReader, offset: u64) -> Result<FilesystemInfo> {
    let boot = reader.read_vec_at(offset, 512)?;
    if &boot[3..11] != b"EXFAT   " {
        return Err(StrataError::Corrupt("missing exFAT OEM id".to_string()));
    }
    let volume_length = LittleEndian::read_u64(&boot[0x48..0x50]);
    let sector_shift = boot[0x6C] as u32;
    let cluster_shift = boot[0x6D] as u32;
    if !(9..=12).contains(&sector_shift) || sector_shift + cluster_shift > 25 {
        return Err(StrataError::Corrupt(format!(
            "exFAT shifts {}/{}",
            sector_shift, cluster_shift
        )));
    }
    let serial = LittleEndian::read_u32(&boot[0x64..0x68]);
    let total_bytes = volume_length
        .checked_mul(1u64 << sector_shift)
        .ok_or_else(|| StrataError::Corrupt(format!("exFAT volume length {} overflows", volume_length)))?;

    Ok(FilesystemInfo {
        filesystem_type: FS_EXFAT.to_string(),
        volume_label: None,
        volume_serial: Some(format!("{:04X}-{:04X}", serial >> 16, serial & 0xFFFF)),
        total_bytes,
        cluster_size: Some(1u32 << (sector_shift + cluster_shift)),
    })
}

fn read_ext(implementation: &str, reader: &BlockReader, offset: u64) -> Result<FilesystemInfo> {
    let sb = reader.read_vec_at(offset.saturating_add(EXT_SUPERBLOCK_OFFSET), 1024)?;
    if LittleEndian::read_u16(&sb[56..58]) != EXT_MAGIC {
        return Err(StrataError::Corrupt("bad ext superblock magic".to_string()));
    }
    let blocks = LittleEndian::read_u32(&sb[4..8]) as u64;
    let log_block_size = LittleEndian::read_u32(&sb[24..28]);
    if log_block_size > 6 {
        return Err(StrataError::Corrupt(format!("ext log block size {}", log_block_size)));
    }
    let block_size = 1024u64 << log_block_size;

    let name = &sb[120..136];
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let label = String::from_utf8_lossy(&name[..end]).trim().to_string();

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&sb[104..120]);

    Ok(FilesystemInfo {
        filesystem_type: implementation.to_string(),
        volume_label: (!label.is_empty()).then_some(label),
        volume_serial: Some(uuid::Uuid::from_bytes(uuid).to_string()),
        total_bytes: blocks * block_size,
        cluster_size: Some(block_size as u32),
    })
}

impl FilesystemView for MetadataFilesystem {
    fn filesystem_type(&self) -> &str {
        &self.info.filesystem_type
    }

    fn info(&self) -> FilesystemInfo {
        self.info.clone()
    }

    fn root_directory(&self) -> Result<Vec<DirectoryEntry>> {
        Err(StrataError::NotSupported(format!(
            "directory listing for {}",
            self.info.filesystem_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::test_utils::memory_reader;

    #[test]
    fn test_ntfs_metadata() {
        let mut data = vec![0u8; 1024];
        data[3..11].copy_from_slice(b"NTFS    ");
        data[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        data[0x0D] = 8;
        data[0x28..0x30].copy_from_slice(&2048u64.to_le_bytes());
        data[0x48..0x50].copy_from_slice(&0x0011_2233_4455_6677u64.to_le_bytes());

        let fs = MetadataFilesystem::open(FS_NTFS, memory_reader(data), 0).unwrap();
        let info = fs.info();
        assert_eq!(info.total_bytes, 2048 * 512);
        assert_eq!(info.cluster_size, Some(4096));
        assert_eq!(info.volume_serial.as_deref(), Some("0011223344556677"));
        assert!(matches!(fs.root_directory(), Err(StrataError::NotSupported(_))));
    }

    #[test]
    fn test_exfat_metadata_at_offset() {
        let mut data = vec![0u8; 1024];
        let boot = &mut data[512..];
        boot[3..11].copy_from_slice(b"EXFAT   ");
        boot[0x48..0x50].copy_from_slice(&100u64.to_le_bytes());
        boot[0x64..0x68].copy_from_slice(&0xABCD_1234u32.to_le_bytes());
        boot[0x6C] = 9;
        boot[0x6D] = 3;

        let fs = MetadataFilesystem::open(FS_EXFAT, memory_reader(data), 512).unwrap();
        let info = fs.info();
        assert_eq!(info.total_bytes, 100 * 512);
        assert_eq!(info.cluster_size, Some(4096));
        assert_eq!(info.volume_serial.as_deref(), Some("ABCD-1234"));
    }

    #[test]
    fn test_ext_metadata() {
        let mut data = vec![0u8; 4096];
        let sb = EXT_SUPERBLOCK_OFFSET as usize;
        data[sb + 4..sb + 8].copy_from_slice(&4u32.to_le_bytes());
        data[sb + 24..sb + 28].copy_from_slice(&0u32.to_le_bytes());
        data[sb + 56..sb + 58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        data[sb + 120..sb + 124].copy_from_slice(b"home");

        let fs = MetadataFilesystem::open(FS_EXT3, memory_reader(data), 0).unwrap();
        assert_eq!(fs.filesystem_type(), FS_EXT3);
        let info = fs.info();
        assert_eq!(info.total_bytes, 4096);
        assert_eq!(info.volume_label.as_deref(), Some("home"));
    }

    #[test]
    fn test_overflowing_sizes_are_corrupt() {
        let mut ntfs = vec![0u8; 512];
        ntfs[3..11].copy_from_slice(b"NTFS    ");
        ntfs[0x0B..0x0D].copy_from_slice(&4096u16.to_le_bytes());
        ntfs[0x0D] = 1;
        ntfs[0x28..0x30].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            MetadataFilesystem::open(FS_NTFS, memory_reader(ntfs), 0),
            Err(StrataError::Corrupt(_))
        ));

        let mut exfat = vec![0u8; 512];
        exfat[3..11].copy_from_slice(b"EXFAT   ");
        exfat[0x48..0x50].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        exfat[0x6C] = 12;
        assert!(matches!(
            MetadataFilesystem::open(FS_EXFAT, memory_reader(exfat), 0),
            Err(StrataError::Corrupt(_))
        ));
    }

    #[test]
    fn test_wrong_signature_is_corrupt() {
        let data = vec![0u8; 4096];
        assert!(matches!(
            MetadataFilesystem::open(FS_NTFS, memory_reader(data.clone()), 0),
            Err(StrataError::Corrupt(_))
        ));
        assert!(matches!(
            MetadataFilesystem::open("zfs", memory_reader(data), 0),
            Err(StrataError::NotSupported(_))
        ));
    }
}
