//! Built-in decoders for partition tables and filesystem signatures, plus
//! the filesystem views they feed.

pub mod fat;
pub mod gpt;
pub mod mbr;
pub mod metadata;
pub mod registration;
pub mod signature;

pub use fat::{FatFilesystem, FatType};
pub use gpt::GptDecoder;
pub use mbr::MbrDecoder;
pub use metadata::MetadataFilesystem;
pub use registration::{builtin_registry, register_builtin_plugins};
pub use signature::FilesystemSignatureDecoder;
