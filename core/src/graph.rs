// Immutable, uid-indexed block arena produced by a scan

use crate::block::{Block, Uid, UNASSIGNED_UID};
use crate::{Result, StrataError};

/// The block list of one scan generation. Block `uid` lives at `uid - 1`.
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<Block>,
    passes: usize,
}

impl BlockGraph {
    pub(crate) fn new(blocks: Vec<Block>, passes: usize) -> Self {
        Self { blocks, passes }
    }

    /// Build a graph from registered blocks, rejecting dangling or
    /// inconsistent relations
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        let graph = Self::new(blocks, 0);
        graph.validate()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Decode passes it took to reach the fixed point (0 when rehydrated)
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn get(&self, uid: Uid) -> Option<&Block> {
        if uid == UNASSIGNED_UID {
            return None;
        }
        self.blocks.get((uid - 1) as usize)
    }

    pub fn block(&self, uid: Uid) -> Result<&Block> {
        self.get(uid).ok_or(StrataError::InvalidUid {
            uid,
            len: self.blocks.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn as_slice(&self) -> &[Block] {
        &self.blocks
    }

    /// Root blocks, one per disk, in disk order
    pub fn roots(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_disk())
    }

    pub fn parents_of(&self, uid: Uid) -> Result<Vec<&Block>> {
        self.block(uid)?
            .parents()
            .iter()
            .map(|p| self.block(*p))
            .collect()
    }

    pub fn children_of(&self, uid: Uid) -> Result<Vec<&Block>> {
        self.block(uid)?
            .children()
            .iter()
            .map(|c| self.block(*c))
            .collect()
    }

    pub fn by_type<'a>(&'a self, block_type: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |b| b.block_type() == block_type)
    }

    /// Available blocks no decoder claimed
    pub fn unhandled(&self) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(|b| b.is_available() && !b.is_handled())
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| !b.is_complete())
    }

    /// Check uid placement, relation bounds and relation symmetry
    pub fn validate(&self) -> Result<()> {
        let len = self.blocks.len();
        let in_range = |uid: Uid| uid != UNASSIGNED_UID && (uid as usize) <= len;

        for (index, block) in self.blocks.iter().enumerate() {
            let expected = index as Uid + 1;
            if block.uid() != expected {
                return Err(StrataError::InvalidState(format!(
                    "block at position {} has uid {}",
                    expected,
                    block.uid()
                )));
            }

            for &parent in block.parents() {
                if !in_range(parent) {
                    return Err(StrataError::DanglingReference {
                        from: expected,
                        to: parent,
                        relation: "parent",
                    });
                }
            }
            for &child in block.children() {
                if !in_range(child) {
                    return Err(StrataError::DanglingReference {
                        from: expected,
                        to: child,
                        relation: "child",
                    });
                }
            }
        }

        for block in &self.blocks {
            for &child in block.children() {
                if !self.blocks[(child - 1) as usize].parents().contains(&block.uid()) {
                    return Err(StrataError::InvalidState(format!(
                        "block {} lists child {} which does not list it as parent",
                        block.uid(),
                        child
                    )));
                }
            }
            for &parent in block.parents() {
                if !self.blocks[(parent - 1) as usize].children().contains(&block.uid()) {
                    return Err(StrataError::InvalidState(format!(
                        "block {} lists parent {} which does not list it as child",
                        block.uid(),
                        parent
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(uid: Uid, block_type: &str) -> Block {
        let mut block = Block::detached(block_type, 0);
        block.set_uid(uid).unwrap();
        block
    }

    #[test]
    fn test_lookup_and_relations() {
        let mut a = registered(1, "volume");
        let mut b = registered(2, "filesystem");
        a.add_child(2);
        b.add_parent(1).unwrap();

        let graph = BlockGraph::from_blocks(vec![a, b]).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.get(0).is_none());
        assert!(graph.get(3).is_none());
        assert!(matches!(graph.block(9), Err(StrataError::InvalidUid { uid: 9, len: 2 })));
        assert_eq!(graph.children_of(1).unwrap()[0].uid(), 2);
        assert_eq!(graph.parents_of(2).unwrap()[0].uid(), 1);
        assert_eq!(graph.by_type("filesystem").count(), 1);
    }

    #[test]
    fn test_validate_rejects_dangling_child() {
        let mut a = registered(1, "volume");
        a.add_child(5);
        let err = BlockGraph::from_blocks(vec![a]).unwrap_err();
        assert!(matches!(
            err,
            StrataError::DanglingReference { from: 1, to: 5, relation: "child" }
        ));
    }

    #[test]
    fn test_validate_rejects_zero_parent() {
        let mut a = registered(1, "volume");
        a.add_parent(0).unwrap();
        assert!(matches!(
            BlockGraph::from_blocks(vec![a]),
            Err(StrataError::DanglingReference { to: 0, relation: "parent", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_one_sided_relation() {
        let mut a = registered(1, "volume");
        let b = registered(2, "filesystem");
        a.add_child(2);
        assert!(matches!(
            BlockGraph::from_blocks(vec![a, b]),
            Err(StrataError::InvalidState(_))
        ));
    }

    #[test]
    fn test_validate_rejects_misplaced_uid() {
        let a = registered(2, "volume");
        assert!(matches!(
            BlockGraph::from_blocks(vec![a]),
            Err(StrataError::InvalidState(_))
        ));
    }
}
