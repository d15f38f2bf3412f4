//! Bridge configuration
//!
//! Loaded from JSON. Every field has a default, so `{}` is a complete config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::runtime::heap::HeapConfig;

/// Prefix the host puts in front of native modules living inside packages.
pub const DEFAULT_PACKAGE_PREFIX: &str = "__native__.";

/// Run in every freshly built module namespace.
pub const DEFAULT_BOOTSTRAP: &str = "import sys\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub heap: HeapConfig,
    /// Stripped from requested module names; `None` disables stripping.
    pub package_prefix: Option<String>,
    pub bootstrap: String,
    /// Decref at zero fails instead of warning.
    pub strict_refcounts: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
            package_prefix: Some(DEFAULT_PACKAGE_PREFIX.to_string()),
            bootstrap: DEFAULT_BOOTSTRAP.to_string(),
            strict_refcounts: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> BridgeResult<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::Config {
            path: None,
            message: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        Self::from_json(&text).map_err(|e| match e {
            BridgeError::Config { message, .. } => BridgeError::Config {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
