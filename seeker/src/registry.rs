//! Descriptor registry
//!
//! Maps `(namespace, record type)` to a [`DocumentDescriptor`]. Built
//! during process start, read for the rest of the process lifetime, and
//! reset between tests. Holds descriptors only, never record data.

use crate::config::RegistrationMode;
use crate::error::{Error, Result};
use crate::schema::DocumentDescriptor;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub namespace: String,
    pub record_type: String,
}

impl RegistryKey {
    pub fn new(namespace: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            record_type: record_type.into(),
        }
    }

    pub fn for_descriptor(namespace: impl Into<String>, descriptor: &DocumentDescriptor) -> Self {
        Self::new(namespace, descriptor.record_type())
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.record_type)
    }
}

pub struct Registry {
    mode: RegistrationMode,
    /// Registration order is kept for `all()`
    entries: RwLock<Vec<(RegistryKey, Arc<DocumentDescriptor>)>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistrationMode::default())
    }
}

impl Registry {
    pub fn new(mode: RegistrationMode) -> Self {
        Self {
            mode,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> RegistrationMode {
        self.mode
    }

    /// Bind a descriptor to a key.
    ///
    /// In strict mode a bound key fails with `DuplicateRegistration`; in
    /// permissive mode the new descriptor replaces the old one in place.
    pub fn register(
        &self,
        key: RegistryKey,
        descriptor: DocumentDescriptor,
    ) -> Result<Arc<DocumentDescriptor>> {
        if key.record_type != descriptor.record_type() {
            return Err(Error::InvalidDescriptor(format!(
                "key {} does not match descriptor record type '{}'",
                key,
                descriptor.record_type()
            )));
        }

        let descriptor = Arc::new(descriptor);
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(_) if self.mode == RegistrationMode::Strict => {
                return Err(Error::DuplicateRegistration(key.to_string()));
            }
            Some(entry) => {
                warn!(key = %key, "Replacing registered descriptor");
                entry.1 = descriptor.clone();
            }
            None => {
                debug!(
                    key = %key,
                    index = descriptor.index_name(),
                    doc_type = descriptor.doc_type(),
                    "Registered descriptor"
                );
                entries.push((key, descriptor.clone()));
            }
        }
        Ok(descriptor)
    }

    pub fn lookup(&self, key: &RegistryKey) -> Result<Arc<DocumentDescriptor>> {
        self.entries
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| Error::NotRegistered(key.to_string()))
    }

    /// Every descriptor, in registration order
    pub fn all(&self) -> Vec<Arc<DocumentDescriptor>> {
        self.entries.read().iter().map(|(_, d)| d.clone()).collect()
    }

    /// Descriptors for a record type across all namespaces
    pub fn for_record_type(&self, record_type: &str) -> Vec<Arc<DocumentDescriptor>> {
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| k.record_type == record_type)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn namespace(&self, namespace: &str) -> Vec<Arc<DocumentDescriptor>> {
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<RegistryKey> {
        self.entries.read().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn reset(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
