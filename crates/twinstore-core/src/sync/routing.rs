//! Routing policy: entity namespace + source store → target store.
//!
//! Exactly two stores exist. Mirrored namespaces replicate to whichever store
//! did not originate the write; excluded namespaces are single-homed on the
//! primary store and never leave it.

use std::collections::BTreeSet;
use twinstore_types::{RoutingError, StoreId, SyncConfig};

#[derive(Debug, Clone)]
pub struct RoutingTable {
    primary: StoreId,
    replica: StoreId,
    excluded: BTreeSet<String>,
    /// `None` routes every non-excluded namespace; `Some` only the listed ones.
    mirrored: Option<BTreeSet<String>>,
}

impl RoutingTable {
    /// Table that mirrors every namespace not listed as excluded.
    pub fn new(
        primary: StoreId,
        replica: StoreId,
        excluded: impl IntoIterator<Item = String>,
    ) -> Self {
        Self { primary, replica, excluded: excluded.into_iter().collect(), mirrored: None }
    }

    /// Permissive table straight from config. Used by maintenance tooling that
    /// has no entity registry (dead-letter replay).
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.primary.store_id(),
            config.replica.store_id(),
            config.excluded_namespaces.iter().cloned(),
        )
    }

    /// Restrict mirroring to the given namespaces; anything else becomes a
    /// routing error.
    pub fn restrict_to<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mirrored = namespaces
            .into_iter()
            .map(Into::into)
            .filter(|ns: &String| !self.excluded.contains(ns))
            .collect();
        self.mirrored = Some(mirrored);
        self
    }

    pub fn primary(&self) -> &StoreId {
        &self.primary
    }

    pub fn replica(&self) -> &StoreId {
        &self.replica
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded.contains(namespace)
    }

    /// Whether `store` is one of the configured pair.
    pub fn knows_store(&self, store: &StoreId) -> bool {
        *store == self.primary || *store == self.replica
    }

    /// Resolve the single target store for a write.
    ///
    /// Excluded namespaces always resolve to the primary store, whatever the
    /// source.
    pub fn route(&self, namespace: &str, source: &StoreId) -> Result<StoreId, RoutingError> {
        if self.is_excluded(namespace) {
            return Ok(self.primary.clone());
        }
        if let Some(mirrored) = &self.mirrored {
            if !mirrored.contains(namespace) {
                return Err(RoutingError::UnknownNamespace { namespace: namespace.to_string() });
            }
        }

        if *source == self.primary {
            Ok(self.replica.clone())
        } else if *source == self.replica {
            Ok(self.primary.clone())
        } else {
            Err(RoutingError::UnknownStore { store: source.to_string() })
        }
    }
}
