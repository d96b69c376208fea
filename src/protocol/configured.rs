//! Protocols described by a TOML descriptor file
//!
//! Used by the admin binary, which needs ids, labels and copy rules but never
//! talks to the networks themselves.
//!
//! ```toml
//! [[protocols]]
//! label = "activitypub"
//! abbreviation = "ap"
//! has_copies = true
//! default_enabled = ["web"]
//! native_format = "as2"
//! id_patterns = ["^https?://"]
//! ```

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::protocol::{Protocol, ProtocolDescriptor};
use crate::types::{BridgeError, Result};

#[derive(Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    protocols: Vec<DescriptorEntry>,
}

#[derive(Deserialize)]
struct DescriptorEntry {
    #[serde(flatten)]
    descriptor: ProtocolDescriptor,

    /// Regexes for ids this protocol owns
    #[serde(default)]
    id_patterns: Vec<String>,
}

/// A protocol whose id ownership is a list of patterns
pub struct ConfiguredProtocol {
    descriptor: ProtocolDescriptor,
    id_patterns: Vec<Regex>,
}

impl ConfiguredProtocol {
    pub fn new(descriptor: ProtocolDescriptor, patterns: &[String]) -> Result<Self> {
        let id_patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    BridgeError::Config(format!(
                        "Invalid id pattern for {}: {}",
                        descriptor.label, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            descriptor,
            id_patterns,
        })
    }

    /// Parses every protocol in a descriptor document
    pub fn parse_all(toml_str: &str) -> Result<Vec<Arc<dyn Protocol>>> {
        let file: DescriptorFile = toml::from_str(toml_str)
            .map_err(|e| BridgeError::Config(format!("Invalid protocol descriptors: {}", e)))?;

        file.protocols
            .into_iter()
            .map(|entry| {
                Self::new(entry.descriptor, &entry.id_patterns)
                    .map(|p| Arc::new(p) as Arc<dyn Protocol>)
            })
            .collect()
    }

    /// Loads every protocol in a descriptor file
    pub fn load_file(path: &Path) -> Result<Vec<Arc<dyn Protocol>>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_all(&contents)
    }
}

impl Protocol for ConfiguredProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn owns_id(&self, id: &str) -> Option<bool> {
        if self.id_patterns.iter().any(|re| re.is_match(id)) {
            Some(true)
        } else {
            None
        }
    }
}
