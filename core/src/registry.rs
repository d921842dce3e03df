use crate::decoder::Decoder;
use crate::filesystem::FilesystemView;
use crate::reader::BlockReader;
use crate::{Result, StrataError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory building a filesystem view from a reader and a byte offset
pub type FilesystemFactory =
    Box<dyn Fn(BlockReader, u64) -> Result<Box<dyn FilesystemView>> + Send + Sync>;

/// Plugins available to a scan: decoders in registration order and
/// filesystem builders keyed by implementation tag.
///
/// Passed to the engine explicitly so each engine (and each test) decides
/// exactly which plugins take part.
pub struct Registry {
    decoders: Vec<Arc<dyn Decoder>>,
    filesystems: HashMap<String, FilesystemFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            decoders: Vec::new(),
            filesystems: HashMap::new(),
        }
    }

    /// Append a decoder. Decoders are tried in registration order.
    pub fn register_decoder(&mut self, decoder: Arc<dyn Decoder>) {
        self.decoders.push(decoder);
    }

    /// Register a filesystem builder for an implementation tag
    pub fn register_filesystem<F>(&mut self, implementation: &str, factory: F)
    where
        F: Fn(BlockReader, u64) -> Result<Box<dyn FilesystemView>> + Send + Sync + 'static,
    {
        self.filesystems
            .insert(implementation.to_string(), Box::new(factory));
    }

    pub fn decoders(&self) -> &[Arc<dyn Decoder>] {
        &self.decoders
    }

    pub fn decoder_names(&self) -> Vec<String> {
        self.decoders.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn filesystem_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.filesystems.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_supported(&self, implementation: &str) -> bool {
        self.filesystems.contains_key(implementation)
    }

    /// Instantiate the filesystem view registered for `implementation`
    pub fn build_filesystem(
        &self,
        implementation: &str,
        reader: BlockReader,
        offset: u64,
    ) -> Result<Box<dyn FilesystemView>> {
        let factory = self.filesystems.get(implementation).ok_or_else(|| {
            StrataError::NotSupported(format!(
                "no filesystem builder registered for '{}'",
                implementation
            ))
        })?;
        factory(reader, offset)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
