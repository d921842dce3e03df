//! Flat, index-addressed serialization of disks and the block graph.
//!
//! Disks are addressed by position, blocks by uid (position + 1). Loading a
//! state rebinds block layouts to the reopened disks without running any
//! decoder; every relation must resolve inside the same state.

use crate::attribute::Attributes;
use crate::block::{Block, Uid};
use crate::disk::{disk_from_state, DiskRef, DiskState};
use crate::graph::BlockGraph;
use crate::reader::Layout;
use crate::{Result, StrataError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const STATE_VERSION: u32 = 1;

/// Serialized form of one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockState {
    pub uid: Uid,
    pub block_type: String,
    pub size: u64,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub parents: Vec<Uid>,
    #[serde(default)]
    pub children: Vec<Uid>,
    #[serde(default)]
    pub handled: bool,
    #[serde(default = "default_true")]
    pub complete: bool,
    #[serde(default = "default_true")]
    pub available: bool,
    pub layout: Layout,
}

fn default_true() -> bool {
    true
}

/// Versioned record of a whole engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsState {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    pub disks: Vec<DiskState>,
    pub blocks: Vec<BlockState>,
}

impl VfsState {
    pub fn new(disks: Vec<DiskState>, blocks: Vec<BlockState>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            disks,
            blocks,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)?;
        info!(path = %path.display(), blocks = self.blocks.len(), "Saved scan state");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let state = Self::from_json(&fs::read_to_string(path)?)?;
        debug!(path = %path.display(), version = state.version, "Loaded scan state");
        Ok(state)
    }

    /// Reopen the disks and rebuild the block graph
    pub fn rehydrate(&self) -> Result<(Vec<DiskRef>, BlockGraph)> {
        if self.version != STATE_VERSION {
            return Err(StrataError::NotSupported(format!(
                "state version {} (expected {})",
                self.version, STATE_VERSION
            )));
        }

        let disks: Vec<DiskRef> = self.disks.iter().map(disk_from_state).collect();
        let graph = rehydrate_blocks(&self.blocks, &disks)?;
        Ok((disks, graph))
    }
}

/// Rebuild a validated graph from block states bound to `disks`
pub fn rehydrate_blocks(states: &[BlockState], disks: &[DiskRef]) -> Result<BlockGraph> {
    let len = states.len();
    for state in states {
        let check = |uid: Uid, relation: &'static str| {
            if uid == 0 || uid as usize > len {
                Err(StrataError::DanglingReference {
                    from: state.uid,
                    to: uid,
                    relation,
                })
            } else {
                Ok(())
            }
        };
        for &parent in &state.parents {
            check(parent, "parent")?;
        }
        for &child in &state.children {
            check(child, "child")?;
        }
    }

    let blocks = states
        .iter()
        .map(|state| Block::from_state(state, disks))
        .collect::<Result<Vec<_>>>()?;
    BlockGraph::from_blocks(blocks)
}
