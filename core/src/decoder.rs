use crate::block::Block;
use crate::Result;

/// A plugin that recognises the content of one block and may produce
/// child blocks.
///
/// Return values:
/// - `Ok(true)`: the block was recognised and consumed. Blocks pushed to
///   `new_blocks` become its children. Producing none is fine, the block
///   is still marked handled and never offered again.
/// - `Ok(false)`: not this decoder's format.
/// - `Err(_)`: recognised but could not be parsed. The engine logs it and
///   moves on to the next decoder.
///
/// `incomplete` lists the blocks of the graph that are still partial
/// reconstructions, for decoders assembling structures across several
/// blocks (RAID members, spanned volumes). New blocks may reference them
/// through `add_parent`.
pub trait Decoder: Send + Sync {
    /// Identifier used in logs and events
    fn name(&self) -> &str;

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, incomplete: &[&Block]) -> Result<bool>;
}

/// Adapter turning a closure into a decoder
pub struct FnDecoder<F> {
    name: String,
    func: F,
}

impl<F> FnDecoder<F>
where
    F: Fn(&Block, &mut Vec<Block>, &[&Block]) -> Result<bool> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Decoder for FnDecoder<F>
where
    F: Fn(&Block, &mut Vec<Block>, &[&Block]) -> Result<bool> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, block: &Block, new_blocks: &mut Vec<Block>, incomplete: &[&Block]) -> Result<bool> {
        (self.func)(block, new_blocks, incomplete)
    }
}
