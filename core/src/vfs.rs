//! The composition engine.
//!
//! `Vfs` owns the disk list and lazily derives two views per generation:
//! the block graph (fixed-point decode loop) and the root entries (one per
//! instantiable filesystem block). Each view sits in a cache slot guarded
//! by the engine mutex:
//!
//! ```text
//!   Empty --(first accessor)--> Computing --(done)--> Ready(Arc<T>)
//!     ^                             |
//!     +------(error / panic)--------+
//! ```
//!
//! Accessors that find a slot `Computing` wait on the condition variable,
//! so concurrent callers compute at most once and all observe the same
//! `Arc`. Invalidating operations wait until no slot is `Computing` before
//! touching the disk list, so an invalidation lands strictly before or
//! after a computation, never inside it.
//!
//! Decoding and filesystem instantiation run without holding the mutex.
//! Event sinks and plugins must not call back into the engine that is
//! running them.

use crate::block::{Block, Uid, ATTR_FS_IMPLEMENTATION, ATTR_FS_OFFSET, BLOCK_TYPE_FILESYSTEM};
use crate::decoder::Decoder;
use crate::disk::DiskRef;
use crate::events::{EventBus, EventSink, ScanEvent};
use crate::filesystem::{FilesystemView, RootEntry};
use crate::graph::BlockGraph;
use crate::options::ScanOptions;
use crate::reader::BlockReader;
use crate::registry::Registry;
use crate::state::VfsState;
use crate::{Result, StrataError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};


enum Slot<T> {
    Empty,
    Computing,
    Ready(Arc<T>),
}

impl<T> Slot<T> {
    fn is_computing(&self) -> bool {
        matches!(self, Slot::Computing)
    }
}

struct EngineState {
    disks: Vec<DiskRef>,
    blocks: Slot<BlockGraph>,
    roots: Slot<Vec<RootEntry>>,
}

impl EngineState {
    fn is_computing(&self) -> bool {
        self.blocks.is_computing() || self.roots.is_computing()
    }

    fn invalidate(&mut self) {
        self.blocks = Slot::Empty;
        self.roots = Slot::Empty;
    }
}

#[derive(Clone, Copy)]
enum SlotKind {
    Blocks,
    Roots,
}

/// Resets a `Computing` slot to `Empty` if the computation unwinds
struct ComputeGuard<'a> {
    vfs: &'a Vfs,
    kind: SlotKind,
    armed: bool,
}

impl ComputeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self
            .vfs
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.kind {
            SlotKind::Blocks => state.blocks = Slot::Empty,
            SlotKind::Roots => state.roots = Slot::Empty,
        }
        self.vfs.changed.notify_all();
    }
}

/// Virtual block composition engine
pub struct Vfs {
    registry: Arc<Registry>,
    options: ScanOptions,
    events: EventBus,
    state: Mutex<EngineState>,
    changed: Condvar,
}

impl Vfs {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_options(registry, ScanOptions::default())
    }

    pub fn with_options(registry: Arc<Registry>, options: ScanOptions) -> Self {
        Self {
            registry,
            options,
            events: EventBus::new(),
            state: Mutex::new(EngineState {
                disks: Vec::new(),
                blocks: Slot::Empty,
                roots: Slot::Empty,
            }),
            changed: Condvar::new(),
        }
    }

    /// Rebuild an engine from a saved state without running any decoder
    pub fn from_state(state: &VfsState, registry: Arc<Registry>) -> Result<Self> {
        Self::from_state_with_options(state, registry, ScanOptions::default())
    }

    pub fn from_state_with_options(
        state: &VfsState,
        registry: Arc<Registry>,
        options: ScanOptions,
    ) -> Result<Self> {
        let (disks, graph) = state.rehydrate()?;
        info!(
            disks = disks.len(),
            blocks = graph.len(),
            "Restored block graph from state"
        );
        let vfs = Self::with_options(registry, options);
        {
            let mut engine = vfs.lock()?;
            engine.disks = disks;
            engine.blocks = Slot::Ready(Arc::new(graph));
        }
        Ok(vfs)
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Attach an observer for scan events
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    // ===== Disk list =====

    /// Append a disk and drop the derived views. Returns the disk index.
    pub fn add_disk(&self, disk: DiskRef) -> Result<usize> {
        let mut state = self.lock_idle()?;
        state.disks.push(disk);
        state.invalidate();
        let index = state.disks.len() - 1;
        debug!(index, "Disk added");
        Ok(index)
    }

    /// Remove the disk at `index`. An out-of-range index is ignored.
    pub fn remove_disk(&self, index: usize) -> Result<()> {
        let mut state = self.lock_idle()?;
        if index >= state.disks.len() {
            debug!(index, disks = state.disks.len(), "No disk at index, nothing removed");
            return Ok(());
        }
        state.disks.remove(index);
        state.invalidate();
        debug!(index, "Disk removed");
        Ok(())
    }

    /// Remove every disk and all derived state
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock_idle()?;
        state.disks.clear();
        state.invalidate();
        Ok(())
    }

    /// Drop the derived views; the next accessor decodes from scratch
    pub fn rescan(&self) -> Result<()> {
        let mut state = self.lock_idle()?;
        state.invalidate();
        debug!("Rescan requested");
        Ok(())
    }

    /// True when there is at least one disk and every disk can be read
    pub fn is_available(&self) -> Result<bool> {
        let state = self.lock()?;
        Ok(!state.disks.is_empty() && state.disks.iter().all(|d| d.is_available()))
    }

    pub fn disks(&self) -> Result<Vec<DiskRef>> {
        Ok(self.lock()?.disks.clone())
    }

    // ===== Derived views =====

    /// The block graph of the current generation, decoding it on first use
    pub fn blocks(&self) -> Result<Arc<BlockGraph>> {
        let mut state = self.lock()?;
        loop {
            match &state.blocks {
                Slot::Ready(graph) => return Ok(Arc::clone(graph)),
                Slot::Computing => state = self.wait(state)?,
                Slot::Empty => break,
            }
        }
        state.blocks = Slot::Computing;
        let disks = state.disks.clone();
        drop(state);

        let mut guard = ComputeGuard {
            vfs: self,
            kind: SlotKind::Blocks,
            armed: true,
        };
        let result = self.decode(&disks);

        let mut state = self.lock()?;
        guard.disarm();
        let result = match result {
            Ok(graph) => {
                let graph = Arc::new(graph);
                state.blocks = Slot::Ready(Arc::clone(&graph));
                Ok(graph)
            }
            Err(e) => {
                state.blocks = Slot::Empty;
                Err(e)
            }
        };
        self.changed.notify_all();
        result
    }

    /// Mounted filesystems of the current generation
    pub fn root_entries(&self) -> Result<Arc<Vec<RootEntry>>> {
        loop {
            let graph = self.blocks()?;

            let mut state = self.lock()?;
            loop {
                match &state.roots {
                    Slot::Ready(entries) => return Ok(Arc::clone(entries)),
                    Slot::Computing => state = self.wait(state)?,
                    Slot::Empty => break,
                }
            }
            // The graph may have been invalidated while we were not holding the lock
            let current = matches!(&state.blocks, Slot::Ready(g) if Arc::ptr_eq(g, &graph));
            if !current {
                continue;
            }
            state.roots = Slot::Computing;
            drop(state);

            let mut guard = ComputeGuard {
                vfs: self,
                kind: SlotKind::Roots,
                armed: true,
            };
            let entries = Arc::new(self.build_root_entries(&graph));

            let mut state = self.lock()?;
            guard.disarm();
            state.roots = Slot::Ready(Arc::clone(&entries));
            self.changed.notify_all();
            return Ok(entries);
        }
    }

    /// Serializable snapshot of the disks and the block graph
    pub fn state(&self) -> Result<VfsState> {
        loop {
            let graph = self.blocks()?;
            let state = self.lock()?;
            if matches!(&state.blocks, Slot::Ready(g) if Arc::ptr_eq(g, &graph)) {
                let disks = state.disks.iter().map(|d| d.state()).collect();
                let blocks = graph.iter().map(|b| b.state()).collect();
                return Ok(VfsState::new(disks, blocks));
            }
        }
    }

    // ===== Locking =====

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|e| StrataError::LockPoisoned(e.to_string()))
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, EngineState>) -> Result<MutexGuard<'a, EngineState>> {
        self.changed
            .wait(guard)
            .map_err(|e| StrataError::LockPoisoned(e.to_string()))
    }

    /// Lock once no view is being computed
    fn lock_idle(&self) -> Result<MutexGuard<'_, EngineState>> {
        let mut state = self.lock()?;
        while state.is_computing() {
            state = self.wait(state)?;
        }
        Ok(state)
    }

    // ===== Decode loop =====

    fn decode(&self, disks: &[DiskRef]) -> Result<BlockGraph> {
        self.events.emit(ScanEvent::ScanStarted { disks: disks.len() });

        let mut blocks = Vec::with_capacity(disks.len());
        for (index, disk) in disks.iter().enumerate() {
            let mut block = Block::for_disk(index, Arc::clone(disk));
            let uid = index as Uid + 1;
            block.set_uid(uid)?;
            debug!(
                uid,
                name = disk.name(),
                size = disk.size(),
                available = disk.is_available(),
                "Root block created"
            );
            self.events.emit(ScanEvent::DiskScanned {
                index,
                name: disk.name().to_string(),
                uid,
            });
            blocks.push(block);
        }

        let decoders = self.registry.decoders();
        let mut passes = 0;
        loop {
            if passes >= self.options.max_passes {
                warn!(
                    max_passes = self.options.max_passes,
                    blocks = blocks.len(),
                    "Pass limit reached before the graph settled"
                );
                break;
            }
            passes += 1;
            let before = blocks.len();
            let changed = self.run_pass(&mut blocks, decoders);
            let new_blocks = blocks.len() - before;
            debug!(pass = passes, new_blocks, changed, "Decode pass finished");
            self.events.emit(ScanEvent::PassCompleted {
                pass: passes,
                new_blocks,
            });
            if !changed {
                break;
            }
        }

        let unhandled = blocks
            .iter()
            .filter(|b| b.is_available() && !b.is_handled())
            .count();
        info!(blocks = blocks.len(), passes, unhandled, "Scan finished");
        self.events.emit(ScanEvent::ScanFinished {
            blocks: blocks.len(),
            passes,
        });
        Ok(BlockGraph::new(blocks, passes))
    }

    /// Offer every unknown block to the decoders once. Returns whether any
    /// decoder claimed a block.
    fn run_pass(&self, blocks: &mut Vec<Block>, decoders: &[Arc<dyn Decoder>]) -> bool {
        let incomplete: Vec<Uid> = blocks
            .iter()
            .filter(|b| !b.is_complete())
            .map(|b| b.uid())
            .collect();
        let unknown: Vec<Uid> = blocks
            .iter()
            .filter(|b| b.is_available() && !b.is_handled())
            .map(|b| b.uid())
            .collect();

        let mut changed = false;
        for uid in unknown {
            for decoder in decoders {
                let mut new_blocks = Vec::new();
                let outcome = {
                    let context: Vec<&Block> = incomplete
                        .iter()
                        .filter_map(|u| blocks.get((*u - 1) as usize))
                        .collect();
                    let block = &blocks[(uid - 1) as usize];
                    self.invoke(decoder.as_ref(), block, &mut new_blocks, &context)
                };

                let result = match outcome {
                    Ok(false) => continue,
                    Ok(true) => self.attach(blocks, uid, new_blocks, decoder.name()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(added) => {
                        debug!(uid, decoder = decoder.name(), added, "Block claimed");
                        changed = true;
                        break;
                    }
                    Err(e) => {
                        warn!(uid, decoder = decoder.name(), error = %e, "Decoder failed");
                        self.events.emit(ScanEvent::DecoderFailed {
                            uid,
                            decoder: decoder.name().to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        changed
    }

    fn invoke(
        &self,
        decoder: &dyn Decoder,
        block: &Block,
        new_blocks: &mut Vec<Block>,
        incomplete: &[&Block],
    ) -> Result<bool> {
        if !self.options.catch_panics {
            return decoder.decode(block, new_blocks, incomplete);
        }
        panic::catch_unwind(AssertUnwindSafe(|| {
            decoder.decode(block, new_blocks, incomplete)
        }))
        .unwrap_or_else(|payload| Err(StrataError::PluginPanic(panic_message(payload.as_ref()))))
    }

    /// Register a claiming decoder's output under `parent` and mark the
    /// parent handled. The output is checked before anything is registered.
    fn attach(
        &self,
        blocks: &mut Vec<Block>,
        parent: Uid,
        new_blocks: Vec<Block>,
        decoder: &str,
    ) -> Result<usize> {
        for block in &new_blocks {
            check_output(block, blocks.len())?;
        }

        let before = blocks.len();
        for block in new_blocks {
            self.register(blocks, block, parent, decoder)?;
        }
        blocks[(parent - 1) as usize].set_handled(true);
        Ok(blocks.len() - before)
    }

    fn register(&self, blocks: &mut Vec<Block>, mut block: Block, parent: Uid, decoder: &str) -> Result<Uid> {
        let uid = blocks.len() as Uid + 1;
        block.set_uid(uid)?;
        block.set_primary_parent(parent)?;
        let children = block.take_new_children();
        let parents = block.parents().to_vec();
        let block_type = block.block_type().to_string();
        blocks.push(block);

        for p in parents {
            blocks[(p - 1) as usize].add_child(uid);
        }
        debug!(uid, parent, block_type = %block_type, decoder, "Block discovered");
        self.events.emit(ScanEvent::BlockDiscovered {
            uid,
            parent,
            block_type,
            decoder: decoder.to_string(),
        });

        for child in children {
            self.register(blocks, child, uid, decoder)?;
        }
        Ok(uid)
    }

    // ===== Root entries =====

    fn build_root_entries(&self, graph: &BlockGraph) -> Vec<RootEntry> {
        let mut entries = Vec::new();
        for block in graph.by_type(BLOCK_TYPE_FILESYSTEM) {
            let uid = block.uid();
            if !block.is_available() {
                debug!(uid, "Filesystem block unavailable, not mounted");
                continue;
            }
            let Some(implementation) = block
                .attribute(ATTR_FS_IMPLEMENTATION)
                .and_then(|v| v.as_str())
            else {
                warn!(uid, "Filesystem block has no implementation tag");
                continue;
            };
            let offset = block
                .attribute(ATTR_FS_OFFSET)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);

            match self.instantiate(implementation, block.new_reader(), offset) {
                Ok(filesystem) => {
                    let name = self.options.root_name(entries.len() + 1);
                    info!(name = %name, uid, implementation, "Filesystem mounted");
                    self.events.emit(ScanEvent::RootEntryMounted {
                        name: name.clone(),
                        uid,
                    });
                    entries.push(RootEntry::new(name, uid, Arc::from(filesystem)));
                }
                Err(e) => {
                    warn!(uid, implementation, error = %e, "Could not open filesystem");
                }
            }
        }
        entries
    }

    fn instantiate(
        &self,
        implementation: &str,
        reader: BlockReader,
        offset: u64,
    ) -> Result<Box<dyn FilesystemView>> {
        if !self.options.catch_panics {
            return self.registry.build_filesystem(implementation, reader, offset);
        }
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.build_filesystem(implementation, reader, offset)
        }))
        .unwrap_or_else(|payload| Err(StrataError::PluginPanic(panic_message(payload.as_ref()))))
    }
}

/// Reject decoder output that is already registered or points at
/// unknown blocks
fn check_output(block: &Block, registered: usize) -> Result<()> {
    if block.uid() != 0 {
        return Err(StrataError::InvariantViolation(format!(
            "decoder returned already registered block {}",
            block.uid()
        )));
    }
    if !block.children().is_empty() {
        return Err(StrataError::InvariantViolation(
            "new blocks must attach children with push_child".to_string(),
        ));
    }
    for &parent in block.parents() {
        if parent == 0 || parent as usize > registered {
            return Err(StrataError::DanglingReference {
                from: 0,
                to: parent,
                relation: "parent",
            });
        }
    }
    for child in block.new_children() {
        check_output(child, registered)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FnDecoder;
    use crate::test_utils::{memory_disk, RecordingSink, StaticFilesystem};

    fn partition_decoder() -> Arc<dyn Decoder> {
        Arc::new(FnDecoder::new("split", |block: &Block, out: &mut Vec<Block>, _: &[&Block]| {
            if !block.is_disk() {
                return Ok(false);
            }
            let half = block.size() / 2;
            out.push(Block::slice(block, 0, half, "partition")?);
            out.push(Block::slice(block, half, half, "partition")?);
            Ok(true)
        }))
    }

    #[test]
    fn test_empty_engine() {
        let vfs = Vfs::new(Arc::new(Registry::new()));
        assert!(!vfs.is_available().unwrap());
        assert!(vfs.blocks().unwrap().is_empty());
        assert!(vfs.root_entries().unwrap().is_empty());
    }

    #[test]
    fn test_blocks_are_memoized() {
        let mut registry = Registry::new();
        registry.register_decoder(partition_decoder());
        let vfs = Vfs::new(Arc::new(registry));
        vfs.add_disk(memory_disk("a", 64)).unwrap();

        let first = vfs.blocks().unwrap();
        let second = vfs.blocks().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 3);
        assert_eq!(first.block(1).unwrap().children(), &[2, 3]);
        assert_eq!(first.passes(), 2);
    }

    #[test]
    fn test_add_disk_invalidates() {
        let vfs = Vfs::new(Arc::new(Registry::new()));
        assert_eq!(vfs.add_disk(memory_disk("a", 16)).unwrap(), 0);
        let first = vfs.blocks().unwrap();
        assert_eq!(vfs.add_disk(memory_disk("b", 16)).unwrap(), 1);
        let second = vfs.blocks().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_remove_out_of_range_is_noop() {
        let vfs = Vfs::new(Arc::new(Registry::new()));
        vfs.add_disk(memory_disk("a", 16)).unwrap();
        let before = vfs.blocks().unwrap();
        vfs.remove_disk(5).unwrap();
        assert!(Arc::ptr_eq(&before, &vfs.blocks().unwrap()));
        vfs.remove_disk(0).unwrap();
        assert!(vfs.blocks().unwrap().is_empty());
    }

    #[test]
    fn test_bad_decoder_output_is_a_failure() {
        let mut registry = Registry::new();
        registry.register_decoder(Arc::new(FnDecoder::new(
            "dangling",
            |block: &Block, out: &mut Vec<Block>, _: &[&Block]| {
                let mut child = Block::slice(block, 0, 1, "partition")?;
                child.add_parent(42)?;
                out.push(child);
                Ok(true)
            },
        )));
        let sink = Arc::new(RecordingSink::new());
        let vfs = Vfs::new(Arc::new(registry));
        vfs.subscribe(sink.clone());
        vfs.add_disk(memory_disk("a", 16)).unwrap();

        let graph = vfs.blocks().unwrap();
        assert_eq!(graph.len(), 1);
        assert!(!graph.block(1).unwrap().is_handled());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ScanEvent::DecoderFailed { uid: 1, .. })));
    }

    #[test]
    fn test_filesystem_builder_panic_is_skipped() {
        let mut registry = Registry::new();
        registry.register_decoder(Arc::new(FnDecoder::new(
            "fs",
            |block: &Block, out: &mut Vec<Block>, _: &[&Block]| {
                if !block.is_disk() {
                    return Ok(false);
                }
                let tag = if block.uid() == 1 { "broken" } else { "static" };
                out.push(
                    Block::slice(block, 0, block.size(), BLOCK_TYPE_FILESYSTEM)?
                        .with_attribute(ATTR_FS_IMPLEMENTATION, tag),
                );
                Ok(true)
            },
        )));
        registry.register_filesystem("broken", |_, _| panic!("bad superblock"));
        registry.register_filesystem("static", |reader, _| {
            Ok(Box::new(StaticFilesystem::new("static", reader.size())))
        });

        let vfs = Vfs::new(Arc::new(registry));
        vfs.add_disk(memory_disk("a", 16)).unwrap();
        vfs.add_disk(memory_disk("b", 32)).unwrap();

        let roots = vfs.root_entries().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name(), "FS01");
        assert_eq!(roots[0].filesystem().info().total_bytes, 32);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "plugin panicked");
    }
}
