use serde::{Deserialize, Serialize};

/// Scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Upper bound on decode passes. Reaching it stops the loop with the
    /// graph built so far.
    pub max_passes: usize,
    /// Treat a panicking plugin like a failing one instead of unwinding
    /// through the engine
    pub catch_panics: bool,
    /// Prefix of positional root entry names ("FS" gives FS01, FS02, ...)
    pub root_prefix: String,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_passes: 64,
            catch_panics: true,
            root_prefix: "FS".to_string(),
        }
    }
}

impl ScanOptions {
    pub fn root_name(&self, position: usize) -> String {
        format!("{}{:02}", self.root_prefix, position)
    }
}
