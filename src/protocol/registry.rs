//! Protocol registry
//!
//! Built once at startup from the protocol implementations, immutable after
//! that. Derives the copy-capable protocol set and the bridge subdomain
//! pattern when built.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::as1;
use crate::db::schemas::WireFormat;
use crate::protocol::Protocol;
use crate::types::{BridgeError, Result};

/// Label of the bridge's own UI. Not a registered protocol; objects it creates
/// use this as their source protocol.
pub const INTERNAL_PROTOCOL: &str = "ui";

/// Builder for [`ProtocolRegistry`]
pub struct RegistryBuilder {
    protocols: Vec<Arc<dyn Protocol>>,
    bridge_domain: String,
    old_account_age: chrono::Duration,
    allow_synthetic: bool,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            protocols: vec![],
            bridge_domain: "brid.gy".to_string(),
            old_account_age: chrono::Duration::days(14),
            allow_synthetic: false,
        }
    }
}

impl RegistryBuilder {
    pub fn register(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn bridge_domain(mut self, domain: impl Into<String>) -> Self {
        self.bridge_domain = domain.into();
        self
    }

    /// Minimum account age for protocols that require old accounts
    pub fn old_account_age(mut self, age: chrono::Duration) -> Self {
        self.old_account_age = age;
        self
    }

    /// Admit synthetic (test-only) protocols
    pub fn allow_synthetic(mut self, allow: bool) -> Self {
        self.allow_synthetic = allow;
        self
    }

    pub fn build(self) -> Result<ProtocolRegistry> {
        let mut by_label = HashMap::new();

        for (index, protocol) in self.protocols.iter().enumerate() {
            let desc = protocol.descriptor();
            if desc.synthetic && !self.allow_synthetic {
                return Err(BridgeError::Config(format!(
                    "Synthetic protocol {} requires dev mode",
                    desc.label
                )));
            }
            if desc.label == INTERNAL_PROTOCOL {
                return Err(BridgeError::Config(format!(
                    "{} is reserved for the bridge UI",
                    INTERNAL_PROTOCOL
                )));
            }
            if desc.label.contains(':') {
                return Err(BridgeError::Config(format!(
                    "Protocol label {} may not contain ':'",
                    desc.label
                )));
            }
            for label in desc.labels() {
                if by_label
                    .insert(label.to_lowercase(), index)
                    .is_some_and(|prev| prev != index)
                {
                    return Err(BridgeError::Config(format!(
                        "Duplicate protocol label {}",
                        label
                    )));
                }
            }
        }

        let copies = self
            .protocols
            .iter()
            .map(|p| p.descriptor())
            .filter(|desc| desc.has_copies)
            .map(|desc| desc.label.clone())
            .collect();

        let mut abbrevs: Vec<String> = by_label.keys().map(|label| regex::escape(label)).collect();
        abbrevs.sort();
        abbrevs.push("fed".to_string());
        let abbrevs = abbrevs.join("|");
        let subdomain_re = Regex::new(&format!(
            r"^https?://(({abbrevs})\.{domain}|localhost(:8080)?)/(convert/|r/)?(({abbrevs})/)?(?P<path>.+)",
            domain = regex::escape(&self.bridge_domain),
        ))
        .map_err(|e| BridgeError::Config(format!("Invalid subdomain pattern: {}", e)))?;

        debug!(
            protocols = self.protocols.len(),
            bridge_domain = %self.bridge_domain,
            "Built protocol registry"
        );

        Ok(ProtocolRegistry {
            protocols: self.protocols,
            by_label,
            copies,
            subdomain_re,
            bridge_domain: self.bridge_domain,
            old_account_age: self.old_account_age,
        })
    }
}

/// Registered protocols plus the tables derived from them
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
    by_label: HashMap<String, usize>,
    copies: Vec<String>,
    subdomain_re: Regex,
    bridge_domain: String,
    old_account_age: chrono::Duration,
}

impl ProtocolRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up a protocol by label, abbreviation or other label.
    /// Unknown labels, including [`INTERNAL_PROTOCOL`], are `None`.
    pub fn lookup(&self, label: &str) -> Option<&Arc<dyn Protocol>> {
        self.by_label
            .get(&label.to_lowercase())
            .map(|&index| &self.protocols[index])
    }

    /// All protocols in registration order
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Protocol>> {
        self.protocols.iter()
    }

    /// Labels of protocols whose users and objects get copies
    pub fn copies_protocols(&self) -> &[String] {
        &self.copies
    }

    pub fn bridge_domain(&self) -> &str {
        &self.bridge_domain
    }

    pub fn old_account_age(&self) -> chrono::Duration {
        self.old_account_age
    }

    /// The protocol whose bridge subdomain `id` is on, eg `ap.brid.gy` or
    /// `https://bsky.brid.gy/...`. Works on bare domains and URLs.
    pub fn for_bridge_subdomain(&self, id: &str) -> Option<&Arc<dyn Protocol>> {
        let domain = if as1::is_web(id) {
            url::Url::parse(id).ok()?.host_str()?.to_lowercase()
        } else {
            id.to_lowercase()
        };

        let label = domain.strip_suffix(&format!(".{}", self.bridge_domain))?;
        self.lookup(label)
    }

    /// The first protocol that claims `id` outright, or whose bridge
    /// subdomain it's on.
    pub fn for_id(&self, id: &str) -> Option<&Arc<dyn Protocol>> {
        if id.is_empty() {
            return None;
        }
        if let Some(protocol) = self.for_bridge_subdomain(id) {
            return Some(protocol);
        }
        self.protocols
            .iter()
            .find(|protocol| protocol.owns_id(id) == Some(true))
    }

    /// The protocol whose native content is stored in `format`
    pub fn for_format(&self, format: WireFormat) -> Option<&Arc<dyn Protocol>> {
        self.protocols
            .iter()
            .find(|protocol| protocol.descriptor().native_format == Some(format))
    }

    /// Strips a bridge subdomain wrapper from a single id, if present.
    pub fn unwrap_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        self.subdomain_re
            .captures(id)
            .and_then(|caps| caps.name("path"))
            .map(|path| path.as_str())
    }

    /// Recursively strips bridge subdomain wrappers from every string in a
    /// document, eg `https://bsky.brid.gy/ap/did:plc:xyz` => `did:plc:xyz`.
    /// Bare domains in `id` and `object` become home page URLs.
    pub fn unwrap_subdomains(&self, val: &mut Value) {
        self.unwrap_field(val, None);
    }

    fn unwrap_field(&self, val: &mut Value, field: Option<&str>) {
        match val {
            Value::Object(map) => {
                for (key, inner) in map.iter_mut() {
                    self.unwrap_field(inner, Some(key.as_str()));
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.unwrap_field(item, field);
                }
            }
            Value::String(s) => {
                if let Some(path) = self.unwrap_id(s) {
                    let unwrapped = if matches!(field, Some("id" | "object")) && as1::is_domain(path) {
                        format!("https://{}/", path)
                    } else {
                        path.to_string()
                    };
                    *s = unwrapped;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolDescriptor;
    use serde_json::json;

    struct Stub {
        desc: ProtocolDescriptor,
        prefix: &'static str,
    }

    impl Protocol for Stub {
        fn descriptor(&self) -> &ProtocolDescriptor {
            &self.desc
        }

        fn owns_id(&self, id: &str) -> Option<bool> {
            if id.starts_with(self.prefix) {
                Some(true)
            } else {
                None
            }
        }
    }

    fn registry() -> ProtocolRegistry {
        let mut ap = ProtocolDescriptor::new("activitypub", "ap");
        ap.native_format = Some(WireFormat::As2);
        let mut atproto = ProtocolDescriptor::new("atproto", "bsky");
        atproto.has_copies = true;
        atproto.other_labels = vec!["bluesky".into()];

        ProtocolRegistry::builder()
            .register(Arc::new(Stub { desc: ap, prefix: "https://" }))
            .register(Arc::new(Stub { desc: atproto, prefix: "did:" }))
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup() {
        let reg = registry();
        assert_eq!(reg.lookup("ap").unwrap().label(), "activitypub");
        assert_eq!(reg.lookup("Bluesky").unwrap().label(), "atproto");
        assert!(reg.lookup("nope").is_none());
        assert!(reg.lookup(INTERNAL_PROTOCOL).is_none());
        assert_eq!(reg.all().count(), 2);
        assert_eq!(reg.copies_protocols(), ["atproto"]);
        assert_eq!(reg.for_format(WireFormat::As2).unwrap().label(), "activitypub");
        assert!(reg.for_format(WireFormat::Mf2).is_none());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let result = ProtocolRegistry::builder()
            .register(Arc::new(Stub { desc: ProtocolDescriptor::new("a", "x"), prefix: "a" }))
            .register(Arc::new(Stub { desc: ProtocolDescriptor::new("b", "x"), prefix: "b" }))
            .build();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_synthetic_needs_dev_mode() {
        let mut desc = ProtocolDescriptor::new("fake", "fa");
        desc.synthetic = true;

        let result = ProtocolRegistry::builder()
            .register(Arc::new(Stub { desc: desc.clone(), prefix: "fake:" }))
            .build();
        assert!(result.is_err());

        let reg = ProtocolRegistry::builder()
            .allow_synthetic(true)
            .register(Arc::new(Stub { desc, prefix: "fake:" }))
            .build()
            .unwrap();
        assert_eq!(reg.for_id("fake:user").unwrap().label(), "fake");
    }

    #[test]
    fn test_for_id() {
        let reg = registry();
        assert_eq!(reg.for_id("did:plc:abc").unwrap().label(), "atproto");
        assert_eq!(reg.for_id("https://inst/alice").unwrap().label(), "activitypub");
        assert_eq!(reg.for_id("bsky.brid.gy").unwrap().label(), "atproto");
        assert_eq!(reg.for_id("https://ap.brid.gy/foo").unwrap().label(), "activitypub");
        assert!(reg.for_id("mailto:x").is_none());
        assert!(reg.for_id("").is_none());
    }

    #[test]
    fn test_unwrap_subdomains() {
        let reg = registry();
        let mut doc = json!({
            "id": "https://bsky.brid.gy/convert/ap/user.com",
            "actor": "https://bsky.brid.gy/ap/did:plc:xyz",
            "object": ["https://inst/note", "https://ap.brid.gy/r/https://user.com/post"],
            "content": "unrelated",
        });
        reg.unwrap_subdomains(&mut doc);
        assert_eq!(
            doc,
            json!({
                "id": "https://user.com/",
                "actor": "did:plc:xyz",
                "object": ["https://inst/note", "https://user.com/post"],
                "content": "unrelated",
            })
        );
    }
}
