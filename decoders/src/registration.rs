use crate::fat::FatFilesystem;
use crate::gpt::GptDecoder;
use crate::mbr::MbrDecoder;
use crate::metadata::MetadataFilesystem;
use crate::signature::{FilesystemSignatureDecoder, FS_EXFAT, FS_EXT2, FS_EXT3, FS_EXT4, FS_NTFS};
use std::sync::Arc;
use strata_core::{Decoder, FilesystemView, Registry};

/// Register the built-in decoders and filesystem builders.
///
/// GPT runs before MBR so a protective MBR never shadows the real table.
/// The signature decoder comes last and only ever wraps whole blocks.
pub fn register_builtin_plugins(registry: &mut Registry) {
    registry.register_decoder(Arc::new(GptDecoder) as Arc<dyn Decoder>);
    registry.register_decoder(Arc::new(MbrDecoder) as Arc<dyn Decoder>);
    registry.register_decoder(Arc::new(FilesystemSignatureDecoder) as Arc<dyn Decoder>);

    for implementation in ["fat12", "fat16", "fat32"] {
        registry.register_filesystem(implementation, |reader, offset| {
            Ok(Box::new(FatFilesystem::open(reader, offset)?) as Box<dyn FilesystemView>)
        });
    }

    for implementation in [FS_NTFS, FS_EXFAT, FS_EXT2, FS_EXT3, FS_EXT4] {
        registry.register_filesystem(implementation, move |reader, offset| {
            Ok(Box::new(MetadataFilesystem::open(implementation, reader, offset)?) as Box<dyn FilesystemView>)
        });
    }
}

/// A registry holding only the built-in plugins
pub fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    register_builtin_plugins(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_plugins() {
        let registry = builtin_registry();
        assert_eq!(registry.decoder_names(), vec!["gpt", "mbr", "fs-signature"]);
        assert_eq!(
            registry.filesystem_types(),
            vec!["exfat", "ext2", "ext3", "ext4", "fat12", "fat16", "fat32", "ntfs"]
        );
    }
}
