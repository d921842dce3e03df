//! Blocks: typed, addressable regions of evidence.
//!
//! A block wraps either a whole disk (a root block) or a region derived
//! from other blocks. Relations to parents and children are uid lists into
//! the engine's block arena; a block never owns another registered block.
//! Freshly decoded blocks may carry not-yet-registered children which the
//! engine registers recursively.

use crate::attribute::{AttributeValue, Attributes};
use crate::disk::DiskRef;
use crate::reader::{BlockReader, Content, Layout};
use crate::state::BlockState;
use crate::{Result, StrataError};
use std::fmt;

/// Block identifier. Assigned from 1 in registration order, 0 = unassigned.
pub type Uid = u64;

pub const UNASSIGNED_UID: Uid = 0;

pub const BLOCK_TYPE_DISK: &str = "disk";
pub const BLOCK_TYPE_PARTITION: &str = "partition";
pub const BLOCK_TYPE_FILESYSTEM: &str = "filesystem";
pub const BLOCK_TYPE_FILE: &str = "file";

/// Attribute naming the filesystem builder for a "filesystem" block
pub const ATTR_FS_IMPLEMENTATION: &str = "fs.implementation";
/// Byte offset of the filesystem inside its block, defaults to 0
pub const ATTR_FS_OFFSET: &str = "fs.offset";

#[derive(Clone)]
pub struct Block {
    uid: Uid,
    block_type: String,
    size: u64,
    attributes: Attributes,
    parents: Vec<Uid>,
    children: Vec<Uid>,
    new_children: Vec<Block>,
    handled: bool,
    complete: bool,
    available: bool,
    content: Content,
    disk: Option<DiskRef>,
}

impl Block {
    fn with_content(block_type: &str, size: u64, content: Content, available: bool) -> Self {
        Self {
            uid: UNASSIGNED_UID,
            block_type: block_type.to_string(),
            size,
            attributes: Attributes::new(),
            parents: Vec::new(),
            children: Vec::new(),
            new_children: Vec::new(),
            handled: false,
            complete: true,
            available,
            content,
            disk: None,
        }
    }

    /// Root block wrapping the disk at `index`
    pub(crate) fn for_disk(index: usize, disk: DiskRef) -> Self {
        let mut block = Self::with_content(
            BLOCK_TYPE_DISK,
            disk.size(),
            Content::Disk(index, disk.clone()),
            disk.is_available(),
        );
        block.attributes = disk.attributes().clone();
        block
            .attributes
            .insert("disk.name".to_string(), disk.name().into());
        block
            .attributes
            .insert("disk.type".to_string(), disk.disk_type().into());
        block.disk = Some(disk);
        block
    }

    /// Child block over `size` bytes of `parent` starting at `offset`
    pub fn slice(parent: &Block, offset: u64, size: u64, block_type: &str) -> Result<Self> {
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > parent.size) {
            return Err(StrataError::InvalidRange {
                offset,
                length: size,
                size: parent.size,
            });
        }
        let content = parent.content.slice(offset, size);
        let available = parent.is_available() && content.is_available();
        let mut block = Self::with_content(block_type, size, content, available);
        block
            .attributes
            .insert("offset".to_string(), AttributeValue::UInt(offset));
        Ok(block)
    }

    /// Block spanning `parts` in order, e.g. a striped or spanned volume
    pub fn concat(parts: &[&Block], block_type: &str) -> Self {
        let contents: Vec<&Content> = parts.iter().map(|b| &b.content).collect();
        let content = Content::concat(&contents);
        let size = parts.iter().map(|b| b.size).sum();
        let available = parts.iter().all(|b| b.is_available()) && content.is_available();
        Self::with_content(block_type, size, content, available)
    }

    /// Block over bytes a decoder produced itself (decompressed, carved, ...)
    pub fn from_bytes(block_type: &str, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::with_content(block_type, size, Content::memory(data), true)
    }

    /// Block of known size whose content cannot be read
    pub fn detached(block_type: &str, size: u64) -> Self {
        Self::with_content(block_type, size, Content::Detached, false)
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Mark a freshly built block as a partial reconstruction
    pub fn incomplete(mut self) -> Self {
        if self.disk.is_none() {
            self.complete = false;
        }
        self
    }

    // ===== Identity =====

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Assign the uid. Only legal while the block is unassigned.
    pub fn set_uid(&mut self, uid: Uid) -> Result<()> {
        if self.uid != UNASSIGNED_UID {
            return Err(StrataError::InvariantViolation(format!(
                "block already has uid {}, cannot reassign to {}",
                self.uid, uid
            )));
        }
        if uid == UNASSIGNED_UID {
            return Err(StrataError::InvariantViolation(
                "uid 0 is reserved for unassigned blocks".to_string(),
            ));
        }
        self.uid = uid;
        Ok(())
    }

    pub fn block_type(&self) -> &str {
        &self.block_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_disk(&self) -> bool {
        self.disk.is_some()
    }

    /// The wrapped disk for root blocks
    pub fn disk(&self) -> Option<&DiskRef> {
        self.disk.as_ref()
    }

    pub fn layout(&self) -> Layout {
        self.content.layout()
    }

    // ===== Relations =====

    /// Register an upward relation. Disk root blocks cannot have parents.
    pub fn add_parent(&mut self, uid: Uid) -> Result<()> {
        if self.is_disk() {
            return Err(StrataError::InvariantViolation(format!(
                "disk block {} cannot have parent {}",
                self.uid, uid
            )));
        }
        if !self.parents.contains(&uid) {
            self.parents.push(uid);
        }
        Ok(())
    }

    /// Put `uid` first among the parents (the block that produced this one)
    pub(crate) fn set_primary_parent(&mut self, uid: Uid) -> Result<()> {
        self.add_parent(uid)?;
        self.parents.retain(|p| *p != uid);
        self.parents.insert(0, uid);
        Ok(())
    }

    pub fn parents(&self) -> &[Uid] {
        &self.parents
    }

    pub fn add_child(&mut self, uid: Uid) {
        if !self.children.contains(&uid) {
            self.children.push(uid);
        }
    }

    pub fn set_children(&mut self, children: Vec<Uid>) {
        self.children = children;
    }

    pub fn children(&self) -> &[Uid] {
        &self.children
    }

    /// Attach a not-yet-registered child; it is registered together with
    /// this block and linked to it.
    pub fn push_child(&mut self, child: Block) {
        self.new_children.push(child);
    }

    pub fn new_children(&self) -> &[Block] {
        &self.new_children
    }

    pub(crate) fn take_new_children(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.new_children)
    }

    // ===== State flags =====

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    /// Disk root blocks are always complete
    pub fn is_complete(&self) -> bool {
        self.is_disk() || self.complete
    }

    pub fn set_complete(&mut self, complete: bool) -> Result<()> {
        if self.is_disk() {
            return Err(StrataError::InvariantViolation(format!(
                "completeness of disk block {} is fixed",
                self.uid
            )));
        }
        self.complete = complete;
        Ok(())
    }

    /// Disk root blocks report their disk's availability
    pub fn is_available(&self) -> bool {
        match &self.disk {
            Some(disk) => disk.is_available(),
            None => self.available,
        }
    }

    pub fn set_available(&mut self, available: bool) -> Result<()> {
        if self.is_disk() {
            return Err(StrataError::InvariantViolation(format!(
                "availability of disk block {} follows its disk",
                self.uid
            )));
        }
        self.available = available;
        Ok(())
    }

    // ===== Content =====

    /// Fresh reader with its own cursor over this block's bytes
    pub fn new_reader(&self) -> BlockReader {
        BlockReader::new(self.content.clone(), self.size)
    }

    // ===== Attributes =====

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Serializable form of this block
    pub fn state(&self) -> BlockState {
        BlockState {
            uid: self.uid,
            block_type: self.block_type.clone(),
            size: self.size,
            attributes: self.attributes.clone(),
            parents: self.parents.clone(),
            children: self.children.clone(),
            handled: self.handled,
            complete: self.is_complete(),
            available: self.is_available(),
            layout: self.layout(),
        }
    }

    /// Rebuild a registered block from its state, binding its layout to `disks`
    pub(crate) fn from_state(state: &BlockState, disks: &[DiskRef]) -> Result<Self> {
        let content = Content::bind(&state.layout, disks)?;
        let mut block = match (&state.layout, &content) {
            (Layout::Disk { index }, Content::Disk(_, disk)) => {
                let mut block = Self::for_disk(*index, disk.clone());
                block.block_type = state.block_type.clone();
                block.size = state.size;
                block
            }
            _ => {
                let available = state.available && content.is_available();
                let mut block =
                    Self::with_content(&state.block_type, state.size, content, available);
                block.complete = state.complete;
                block
            }
        };
        block.set_uid(state.uid)?;
        block.attributes = state.attributes.clone();
        block.handled = state.handled;
        for parent in &state.parents {
            block.add_parent(*parent)?;
        }
        block.children = state.children.clone();
        Ok(block)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("uid", &self.uid)
            .field("block_type", &self.block_type)
            .field("size", &self.size)
            .field("handled", &self.handled)
            .field("complete", &self.is_complete())
            .field("available", &self.is_available())
            .field("parents", &self.parents)
            .field("children", &self.children)
            .field("new_children", &self.new_children.len())
            .finish()
    }
}
