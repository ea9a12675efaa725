//! Declarative description of a storage set.
//!
//! ```json
//! {
//!   "storages": [
//!     { "type": "doc", "impl": "rocksdb", "options": { "space_id": "w1", "path": "./data/doc" } },
//!     { "type": "history", "impl": "memory" }
//!   ]
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{OpError, StorageError};
use crate::storage::StorageType;

/// One configured storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    #[serde(rename = "type")]
    pub kind: StorageType,
    /// Registered implementation name, e.g. `memory` or `rocksdb`
    #[serde(rename = "impl", alias = "implementation")]
    pub implementation: String,
    /// Backend-specific options, opaque to the core
    #[serde(default, alias = "opts")]
    pub options: serde_json::Value,
}

impl StorageDescriptor {
    pub fn new(kind: StorageType, implementation: impl Into<String>) -> Self {
        Self {
            kind,
            implementation: implementation.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the options into a backend's typed options.
    ///
    /// Missing options yield `T::default()`.
    pub fn parse_options<T: DeserializeOwned + Default>(&self) -> Result<T, StorageError> {
        parse_options(&self.options)
    }
}

/// Typed view of a raw options value; `null` yields `T::default()`.
pub fn parse_options<T: DeserializeOwned + Default>(
    options: &serde_json::Value,
) -> Result<T, StorageError> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| StorageError::InvalidOptions(e.to_string()))
}

/// Storage set hosted by one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStorageOptions {
    pub storages: Vec<StorageDescriptor>,
}

impl PeerStorageOptions {
    pub fn new(storages: Vec<StorageDescriptor>) -> Self {
        Self { storages }
    }

    pub fn from_json(json: &str) -> Result<Self, OpError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| OpError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OpError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| OpError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// At most one storage per type.
    pub fn validate(&self) -> Result<(), OpError> {
        let mut seen = HashSet::new();
        for descriptor in &self.storages {
            if !seen.insert(descriptor.kind) {
                return Err(OpError::Config(format!(
                    "storage type `{}` configured more than once",
                    descriptor.kind
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: StorageType) -> Option<&StorageDescriptor> {
        self.storages.iter().find(|d| d.kind == kind)
    }
}
