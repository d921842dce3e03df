pub mod attribute;
pub mod block;
pub mod decoder;
pub mod disk;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod graph;
pub mod options;
pub mod reader;
pub mod registry;
pub mod state;
pub mod vfs;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use attribute::{AttributeValue, Attributes};
pub use block::{Block, Uid, ATTR_FS_IMPLEMENTATION, ATTR_FS_OFFSET, UNASSIGNED_UID};
pub use decoder::{Decoder, FnDecoder};
pub use disk::{disk_from_state, DetachedDisk, Disk, DiskExt, DiskRef, DiskState, ImageDisk, MemoryDisk};
pub use error::{Result, StrataError};
pub use events::{EventSink, FnSink, LoggingSink, ScanEvent};
pub use filesystem::{DirectoryEntry, FilesystemInfo, FilesystemView, RootEntry};
pub use graph::BlockGraph;
pub use options::ScanOptions;
pub use reader::{BlockReader, Extent, Layout};
pub use registry::{FilesystemFactory, Registry};
pub use state::{BlockState, VfsState, STATE_VERSION};
pub use vfs::Vfs;
