// Navigable filesystem views built from "filesystem" blocks

use crate::block::Uid;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Filesystem metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub filesystem_type: String,
    pub volume_label: Option<String>,
    pub volume_serial: Option<String>,
    pub total_bytes: u64,
    pub cluster_size: Option<u32>,
}

/// Entry of a directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// Read-only view over a filesystem.
/// All operations are synchronous, like the rest of the engine.
pub trait FilesystemView: Send + Sync {
    /// Implementation tag, e.g. "fat16"
    fn filesystem_type(&self) -> &str;

    fn info(&self) -> FilesystemInfo;

    /// Entries of the root directory
    fn root_directory(&self) -> Result<Vec<DirectoryEntry>>;
}

/// A mounted filesystem exposed by the engine, named by position
#[derive(Clone)]
pub struct RootEntry {
    name: String,
    block_uid: Uid,
    filesystem: Arc<dyn FilesystemView>,
}

impl RootEntry {
    pub(crate) fn new(name: String, block_uid: Uid, filesystem: Arc<dyn FilesystemView>) -> Self {
        Self {
            name,
            block_uid,
            filesystem,
        }
    }

    /// Positional name, e.g. "FS01"
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uid of the filesystem block this entry was built from
    pub fn block_uid(&self) -> Uid {
        self.block_uid
    }

    pub fn filesystem(&self) -> &Arc<dyn FilesystemView> {
        &self.filesystem
    }
}

impl fmt::Debug for RootEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootEntry")
            .field("name", &self.name)
            .field("block_uid", &self.block_uid)
            .field("filesystem_type", &self.filesystem.filesystem_type())
            .finish()
    }
}
