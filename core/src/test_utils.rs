/// Test utilities: in-memory disks, scripted and misbehaving decoders,
/// recording event sinks. Nothing here touches real media.
use crate::attribute::{AttributeValue, Attributes};
use crate::block::{Block, Uid, ATTR_FS_IMPLEMENTATION, BLOCK_TYPE_FILESYSTEM};
use crate::decoder::Decoder;
use crate::disk::{DiskExt, DiskRef, MemoryDisk};
use crate::events::{EventSink, ScanEvent};
use crate::filesystem::{DirectoryEntry, FilesystemInfo, FilesystemView};
use crate::reader::BlockReader;
use crate::{Result, StrataError};
use std::sync::{Arc, Mutex};

/// Zero-filled memory disk
pub fn memory_disk(name: &str, size: usize) -> DiskRef {
    Arc::new(MemoryDisk::new(name, vec![0u8; size]))
}

/// Memory disk over the given bytes
pub fn memory_disk_with(name: &str, data: Vec<u8>) -> DiskRef {
    Arc::new(MemoryDisk::new(name, data))
}

/// Memory disk whose media is reported missing
pub fn offline_disk(name: &str, size: usize) -> DiskRef {
    Arc::new(MemoryDisk::new(name, vec![0u8; size]).offline())
}

/// Reader over an anonymous memory disk
pub fn memory_reader(data: Vec<u8>) -> BlockReader {
    memory_disk_with("reader", data).new_reader()
}

// ===== Filesystems =====

/// Filesystem view with fixed metadata and root listing
pub struct StaticFilesystem {
    filesystem_type: String,
    total_bytes: u64,
    entries: Vec<DirectoryEntry>,
}

impl StaticFilesystem {
    pub fn new(filesystem_type: &str, total_bytes: u64) -> Self {
        Self {
            filesystem_type: filesystem_type.to_string(),
            total_bytes,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, name: &str, size: u64, is_directory: bool) -> Self {
        self.entries.push(DirectoryEntry {
            name: name.to_string(),
            size,
            is_directory,
        });
        self
    }
}

impl FilesystemView for StaticFilesystem {
    fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    fn info(&self) -> FilesystemInfo {
        FilesystemInfo {
            filesystem_type: self.filesystem_type.clone(),
            volume_label: None,
            volume_serial: None,
            total_bytes: self.total_bytes,
            cluster_size: None,
        }
    }

    fn root_directory(&self) -> Result<Vec<DirectoryEntry>> {
        Ok(self.entries.clone())
    }
}

// ===== Decoders =====

type Predicate = Box<dyn Fn(&Block) -> bool + Send + Sync>;

/// Child emitted by a scripted decoder, as a slice of the claimed block
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub offset: u64,
    pub size: u64,
    pub block_type: String,
    pub attributes: Attributes,
    pub incomplete: bool,
}

impl ChildSpec {
    pub fn new(offset: u64, size: u64, block_type: &str) -> Self {
        Self {
            offset,
            size,
            block_type: block_type.to_string(),
            attributes: Attributes::new(),
            incomplete: false,
        }
    }

    /// A "filesystem" child tagged with `implementation`
    pub fn filesystem(offset: u64, size: u64, implementation: &str) -> Self {
        Self::new(offset, size, BLOCK_TYPE_FILESYSTEM).with_attribute(ATTR_FS_IMPLEMENTATION, implementation)
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    fn build(&self, parent: &Block) -> Result<Block> {
        let mut block = Block::slice(parent, self.offset, self.size, &self.block_type)?;
        for (key, value) in &self.attributes {
            block.set_attribute(key, value.clone());
        }
        if self.incomplete {
            block = block.incomplete();
        }
        Ok(block)
    }
}

/// Decoder claiming blocks that match its filters and emitting fixed children
pub struct ScriptedDecoder {
    name: String,
    block_type: Option<String>,
    predicate: Option<Predicate>,
    children: Vec<ChildSpec>,
    claims: Mutex<Vec<Uid>>,
}

impl ScriptedDecoder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            block_type: None,
            predicate: None,
            children: Vec::new(),
            claims: Mutex::new(Vec::new()),
        }
    }

    /// Only claim blocks of this type
    pub fn on_type(mut self, block_type: &str) -> Self {
        self.block_type = Some(block_type.to_string());
        self
    }

    /// Only claim the root block of the disk called `name`
    pub fn on_disk(self, name: &str) -> Self {
        let name = name.to_string();
        self.when(move |b| {
            b.is_disk() && b.attribute("disk.name").and_then(|v| v.as_str()) == Some(name.as_str())
        })
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Block) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn emit(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Uids this decoder claimed, in order
    pub fn claims(&self) -> Vec<Uid> {
        self.claims.lock().unwrap().clone()
    }

    fn matches(&self, block: &Block) -> bool {
        self.block_type.as_deref().map_or(true, |t| block.block_type() == t)
            && self.predicate.as_ref().map_or(true, |p| p(block))
    }
}

impl Decoder for ScriptedDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        if !self.matches(block) {
            return Ok(false);
        }
        for child in &self.children {
            new_blocks.push(child.build(block)?);
        }
        self.claims.lock().unwrap().push(block.uid());
        Ok(true)
    }
}

/// Decoder that recognises blocks of a type and always fails to parse them
pub struct FailingDecoder {
    name: String,
    block_type: Option<String>,
}

impl FailingDecoder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            block_type: None,
        }
    }

    pub fn on_type(mut self, block_type: &str) -> Self {
        self.block_type = Some(block_type.to_string());
        self
    }
}

impl Decoder for FailingDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, block: &Block, _new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        match &self.block_type {
            Some(t) if block.block_type() != t => Ok(false),
            _ => Err(StrataError::Corrupt(format!("block {} is malformed", block.uid()))),
        }
    }
}

/// Decoder that panics on blocks of a type
pub struct PanickingDecoder {
    name: String,
    block_type: Option<String>,
}

impl PanickingDecoder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            block_type: None,
        }
    }

    pub fn on_type(mut self, block_type: &str) -> Self {
        self.block_type = Some(block_type.to_string());
        self
    }
}

impl Decoder for PanickingDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, _incomplete: &[&Block]) -> Result<bool> {
        if let Some(t) = &self.block_type {
            if block.block_type() != t {
                return Ok(false);
            }
        }
        // Leave garbage behind to make sure it is discarded
        new_blocks.push(Block::detached("garbage", 0));
        panic!("decoder exploded on block {}", block.uid());
    }
}

/// Records every block offered to it, then delegates or declines
pub struct CountingDecoder {
    name: String,
    inner: Option<Arc<dyn Decoder>>,
    offers: Mutex<Vec<Uid>>,
    contexts: Mutex<Vec<Vec<Uid>>>,
}

impl CountingDecoder {
    /// Never claims anything
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: None,
            offers: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn wrap(inner: Arc<dyn Decoder>) -> Self {
        let mut decoder = Self::new(inner.name());
        decoder.inner = Some(inner);
        decoder
    }

    /// Uids offered, in call order
    pub fn offers(&self) -> Vec<Uid> {
        self.offers.lock().unwrap().clone()
    }

    pub fn offers_of(&self, uid: Uid) -> usize {
        self.offers.lock().unwrap().iter().filter(|u| **u == uid).count()
    }

    pub fn count(&self) -> usize {
        self.offers.lock().unwrap().len()
    }

    /// Uids of the incomplete blocks passed along with each offer
    pub fn contexts(&self) -> Vec<Vec<Uid>> {
        self.contexts.lock().unwrap().clone()
    }
}

impl Decoder for CountingDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, incomplete: &[&Block]) -> Result<bool> {
        self.offers.lock().unwrap().push(block.uid());
        self.contexts
            .lock()
            .unwrap()
            .push(incomplete.iter().map(|b| b.uid()).collect());
        match &self.inner {
            Some(inner) => inner.decode(block, new_blocks, incomplete),
            None => Ok(false),
        }
    }
}

// ===== Events =====

/// Sink keeping every event it receives
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ScanEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn sample(&self, event: &ScanEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
