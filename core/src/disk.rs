// Evidence sources: images, device captures and in-memory buffers

use crate::attribute::{AttributeValue, Attributes};
use crate::reader::BlockReader;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DISK_TYPE_IMAGE: &str = "image";
pub const DISK_TYPE_DEVICE: &str = "device";
pub const DISK_TYPE_MEMORY: &str = "memory";

/// A fixed-size, randomly readable byte source.
///
/// Implementations must support concurrent positioned reads from several
/// threads; there is no shared cursor.
pub trait Disk: Send + Sync {
    /// Type tag, e.g. "image" or "device"
    fn disk_type(&self) -> &str;

    fn size(&self) -> u64;

    fn name(&self) -> &str;

    /// Local path backing this disk, if any
    fn path(&self) -> Option<&Path> {
        None
    }

    fn attributes(&self) -> &Attributes;

    fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes().get(key)
    }

    /// Whether the content can currently be read
    fn is_available(&self) -> bool;

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of disk.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Serializable description used to reopen this disk later
    fn state(&self) -> DiskState;
}

pub type DiskRef = Arc<dyn Disk>;

/// Reader construction for shared disk handles
pub trait DiskExt {
    /// Fresh reader with its own cursor over the whole disk
    fn new_reader(&self) -> BlockReader;
}

impl DiskExt for DiskRef {
    fn new_reader(&self) -> BlockReader {
        BlockReader::over_disk(Arc::clone(self))
    }
}

/// Storage backend recorded in a disk state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskBackend {
    Image,
    Memory,
    Detached,
}

/// Serialized form of a disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskState {
    pub backend: DiskBackend,
    pub disk_type: String,
    pub name: String,
    pub size: u64,
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub attributes: Attributes,
    pub available: bool,
}

// ===== Image files and device nodes =====

/// Disk backed by a local image file or device node
pub struct ImageDisk {
    file: File,
    path: PathBuf,
    name: String,
    disk_type: String,
    size: u64,
    attributes: Attributes,
}

impl ImageDisk {
    /// Open an image read-only. The type is "device" for device nodes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        // Device nodes report a zero length in metadata, seeking works for both
        let size = file.seek(SeekFrom::End(0))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let mut attributes = Attributes::new();
        attributes.insert("path".to_string(), path.display().to_string().into());

        debug!(path = %path.display(), size, "Opened image disk");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            name,
            disk_type: image_type_for(path).to_string(),
            size,
            attributes,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    #[cfg(unix)]
    fn positioned_read(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn positioned_read(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }
}

fn image_type_for(path: &Path) -> &'static str {
    let text = path.to_string_lossy();
    if text.starts_with("/dev/") || text.starts_with(r"\\.\") {
        DISK_TYPE_DEVICE
    } else {
        DISK_TYPE_IMAGE
    }
}

impl Disk for ImageDisk {
    fn disk_type(&self) -> &str {
        &self.disk_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn is_available(&self) -> bool {
        true
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let max = ((self.size - offset).min(buf.len() as u64)) as usize;
        Ok(self.positioned_read(offset, &mut buf[..max])?)
    }

    fn state(&self) -> DiskState {
        DiskState {
            backend: DiskBackend::Image,
            disk_type: self.disk_type.clone(),
            name: self.name.clone(),
            size: self.size,
            path: Some(self.path.clone()),
            attributes: self.attributes.clone(),
            available: true,
        }
    }
}

// ===== In-memory buffers =====

/// Disk held entirely in memory
pub struct MemoryDisk {
    data: Arc<[u8]>,
    name: String,
    disk_type: String,
    attributes: Attributes,
    available: bool,
}

impl MemoryDisk {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            data: data.into(),
            name: name.into(),
            disk_type: DISK_TYPE_MEMORY.to_string(),
            attributes: Attributes::new(),
            available: true,
        }
    }

    /// Override the type tag (e.g. to stand in for an "image")
    pub fn with_type(mut self, disk_type: impl Into<String>) -> Self {
        self.disk_type = disk_type.into();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Mark the media as not present
    pub fn offline(mut self) -> Self {
        self.available = false;
        self
    }
}

impl Disk for MemoryDisk {
    fn disk_type(&self) -> &str {
        &self.disk_type
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.available {
            return Err(StrataError::Unavailable(format!("disk {} is offline", self.name)));
        }
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn state(&self) -> DiskState {
        DiskState {
            backend: DiskBackend::Memory,
            disk_type: self.disk_type.clone(),
            name: self.name.clone(),
            size: self.size(),
            path: None,
            attributes: self.attributes.clone(),
            available: self.available,
        }
    }
}

// ===== Detached placeholders =====

/// Metadata-only disk whose media is gone
pub struct DetachedDisk {
    state: DiskState,
}

impl DetachedDisk {
    pub fn from_state(state: &DiskState) -> Self {
        let mut state = state.clone();
        state.available = false;
        Self { state }
    }
}

impl Disk for DetachedDisk {
    fn disk_type(&self) -> &str {
        &self.state.disk_type
    }

    fn size(&self) -> u64 {
        self.state.size
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn path(&self) -> Option<&Path> {
        self.state.path.as_deref()
    }

    fn attributes(&self) -> &Attributes {
        &self.state.attributes
    }

    fn is_available(&self) -> bool {
        false
    }

    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(StrataError::Unavailable(format!(
            "disk {} is detached",
            self.state.name
        )))
    }

    fn state(&self) -> DiskState {
        // Keep the original backend so a later load can retry the path
        self.state.clone()
    }
}

/// Reconstruct a disk from its serialized form.
///
/// Image disks are reopened by path; a missing file or a size mismatch
/// yields a detached disk rather than an error.
pub fn disk_from_state(state: &DiskState) -> DiskRef {
    if state.backend == DiskBackend::Image {
        if let Some(path) = &state.path {
            match ImageDisk::open(path) {
                Ok(disk) if disk.size() == state.size => {
                    let mut disk = disk.with_name(state.name.clone());
                    disk.disk_type = state.disk_type.clone();
                    disk.attributes = state.attributes.clone();
                    return Arc::new(disk);
                }
                Ok(disk) => {
                    warn!(
                        path = %path.display(),
                        expected = state.size,
                        actual = disk.size(),
                        "Image size changed since the state was saved, keeping it detached"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not reopen image");
                }
            }
        }
    }
    Arc::new(DetachedDisk::from_state(state))
}
