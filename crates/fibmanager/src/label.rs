//! Label ownership shared between routing domains.
//!
//! A label is registered when its owning route is first installed locally.
//! Routing domains that self-import the route reuse the owner's forwarding
//! state and are recorded as importers. The label goes back to the allocator
//! when the last importer goes away, and only then.

use crate::collaborators::IdAllocator;
use crate::error::Result;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use vpnfib_orch_common::KeyedLocks;
use vpnfib_types::{IpAddress, IpPrefix, MplsLabel, NodeId, RouteDistinguisher, VpnId};

/// Owner of a label plus the routing domains importing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelRouteInfo {
    pub label: MplsLabel,
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddress>,
    pub node: NodeId,
    pub interface: Option<String>,
    /// Distinguisher the label was allocated under.
    pub parent_rd: RouteDistinguisher,
    pub vpn_id: VpnId,
    pub vpn_name: String,
    pub importers: BTreeSet<String>,
}

impl LabelRouteInfo {
    pub fn importer_count(&self) -> usize {
        self.importers.len()
    }

    /// Same prefix and same next-hop set, order aside.
    pub fn matches(&self, prefix: &IpPrefix, next_hops: &[IpAddress]) -> bool {
        if self.prefix != *prefix {
            return false;
        }
        let mine: BTreeSet<&IpAddress> = self.next_hops.iter().collect();
        let theirs: BTreeSet<&IpAddress> = next_hops.iter().collect();
        mine == theirs
    }

    /// Allocator key the label was handed out under.
    pub fn allocation_key(&self) -> String {
        label_allocation_key(&self.parent_rd, &self.prefix)
    }
}

pub fn label_allocation_key(rd: &RouteDistinguisher, prefix: &IpPrefix) -> String {
    format!("{}.{}", rd, prefix)
}

/// Outcome of dropping an importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImporterRelease {
    /// The label was never registered here.
    NotRegistered,
    /// Other importers still hold the label.
    Remaining(usize),
    /// The last importer left and the label went back to the allocator.
    Released,
}

pub struct LabelRouteRegistry {
    entries: DashMap<MplsLabel, LabelRouteInfo>,
    locks: KeyedLocks<MplsLabel>,
    ids: Arc<dyn IdAllocator>,
    pool: String,
}

impl LabelRouteRegistry {
    pub fn new(ids: Arc<dyn IdAllocator>, pool: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyedLocks::new(),
            ids,
            pool: pool.into(),
        }
    }

    /// Records the owner of `info.label`. Importers of an existing entry
    /// are merged in; the owner fields are refreshed.
    pub async fn register(&self, info: LabelRouteInfo) -> usize {
        let _guard = self.locks.lock(info.label).await;
        let label = info.label;
        let count = match self.entries.get_mut(&label) {
            Some(mut existing) => {
                let importers = std::mem::take(&mut existing.importers);
                *existing = info;
                existing.importers.extend(importers);
                existing.importer_count()
            }
            None => {
                let count = info.importer_count();
                self.entries.insert(label, info);
                count
            }
        };
        debug!("LabelRouteRegistry: label {} registered, {} importers", label, count);
        count
    }

    pub fn lookup(&self, label: MplsLabel) -> Option<LabelRouteInfo> {
        self.entries.get(&label).map(|e| e.value().clone())
    }

    /// The registered owner of `label` if it serves the same prefix and
    /// next hops.
    pub fn lookup_matching(
        &self,
        label: MplsLabel,
        prefix: &IpPrefix,
        next_hops: &[IpAddress],
    ) -> Option<LabelRouteInfo> {
        self.lookup(label).filter(|info| info.matches(prefix, next_hops))
    }

    /// Adds `vpn_name` as an importer. Returns the new count, or `None` if
    /// the label is not registered.
    pub async fn add_importer(&self, label: MplsLabel, vpn_name: &str) -> Option<usize> {
        let _guard = self.locks.lock(label).await;
        let mut entry = self.entries.get_mut(&label)?;
        entry.importers.insert(vpn_name.to_string());
        let count = entry.importer_count();
        debug!(
            "LabelRouteRegistry: {} imports label {}, {} importers",
            vpn_name, label, count
        );
        Some(count)
    }

    /// Drops `vpn_name` as an importer and releases the label once nobody
    /// imports it. A failed release leaves the importer in place so a retry
    /// releases exactly once.
    pub async fn remove_importer(&self, label: MplsLabel, vpn_name: &str) -> Result<ImporterRelease> {
        let _guard = self.locks.lock(label).await;

        let (remaining, key) = match self.entries.get(&label) {
            None => return Ok(ImporterRelease::NotRegistered),
            Some(entry) => {
                let remaining = entry
                    .importers
                    .iter()
                    .filter(|name| name.as_str() != vpn_name)
                    .count();
                (remaining, entry.allocation_key())
            }
        };

        if remaining > 0 {
            if let Some(mut entry) = self.entries.get_mut(&label) {
                entry.importers.remove(vpn_name);
            }
            debug!(
                "LabelRouteRegistry: {} dropped label {}, {} importers left",
                vpn_name, label, remaining
            );
            return Ok(ImporterRelease::Remaining(remaining));
        }

        if let Err(e) = self.ids.release(&self.pool, &key).await {
            warn!(
                "LabelRouteRegistry: failed to release label {} ({}): {}",
                label, key, e
            );
            return Err(e);
        }
        self.entries.remove(&label);
        info!("LabelRouteRegistry: label {} released ({})", label, key);
        Ok(ImporterRelease::Released)
    }

    pub fn importer_count(&self, label: MplsLabel) -> usize {
        self.entries
            .get(&label)
            .map(|e| e.importer_count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Snapshot of every entry, ordered by label.
    pub fn entries(&self) -> Vec<LabelRouteInfo> {
        let mut entries: Vec<LabelRouteInfo> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.label);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::InMemoryFabric;
    use pretty_assertions::assert_eq;

    fn label(value: u32) -> MplsLabel {
        MplsLabel::new(value).unwrap()
    }

    fn owner_info(importer: &str) -> LabelRouteInfo {
        LabelRouteInfo {
            label: label(5000),
            prefix: "20.0.0.0/24".parse().unwrap(),
            next_hops: vec!["192.168.1.5".parse().unwrap()],
            node: NodeId::new(1),
            interface: Some("tap1".to_string()),
            parent_rd: "100:1".parse().unwrap(),
            vpn_id: VpnId::new(1),
            vpn_name: "vpnA".to_string(),
            importers: BTreeSet::from([importer.to_string()]),
        }
    }

    fn registry(fabric: &InMemoryFabric) -> LabelRouteRegistry {
        LabelRouteRegistry::new(Arc::new(fabric.clone()), "vpnservices")
    }

    #[tokio::test]
    async fn test_release_on_last_importer_only() {
        let fabric = InMemoryFabric::new();
        let registry = registry(&fabric);
        registry.register(owner_info("vpnA")).await;
        assert_eq!(registry.add_importer(label(5000), "vpnB").await, Some(2));

        let first = registry.remove_importer(label(5000), "vpnA").await.unwrap();
        assert_eq!(first, ImporterRelease::Remaining(1));
        assert!(fabric.released_ids("vpnservices").is_empty());

        let last = registry.remove_importer(label(5000), "vpnB").await.unwrap();
        assert_eq!(last, ImporterRelease::Released);
        assert_eq!(
            fabric.released_ids("vpnservices"),
            vec!["100:1.20.0.0/24".to_string()]
        );

        let again = registry.remove_importer(label(5000), "vpnB").await.unwrap();
        assert_eq!(again, ImporterRelease::NotRegistered);
        assert_eq!(fabric.released_ids("vpnservices").len(), 1);
    }

    #[tokio::test]
    async fn test_register_merges_importers() {
        let fabric = InMemoryFabric::new();
        let registry = registry(&fabric);
        registry.register(owner_info("vpnA")).await;
        assert_eq!(registry.register(owner_info("vpnB")).await, 2);
        assert_eq!(registry.register(owner_info("vpnB")).await, 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_importer_does_not_release() {
        let fabric = InMemoryFabric::new();
        let registry = registry(&fabric);
        registry.register(owner_info("vpnA")).await;

        let result = registry.remove_importer(label(5000), "vpnZ").await.unwrap();
        assert_eq!(result, ImporterRelease::Remaining(1));
        assert_eq!(registry.importer_count(label(5000)), 1);
    }

    #[test]
    fn test_matching_ignores_next_hop_order() {
        let mut info = owner_info("vpnA");
        info.next_hops = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let prefix: IpPrefix = "20.0.0.0/24".parse().unwrap();
        assert!(info.matches(
            &prefix,
            &["10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap()]
        ));
        assert!(!info.matches(&prefix, &["10.0.0.2".parse().unwrap()]));
        assert!(!info.matches(&"20.0.1.0/24".parse().unwrap(), &info.next_hops.clone()));
    }

    #[tokio::test]
    async fn test_add_importer_requires_registration() {
        let fabric = InMemoryFabric::new();
        let registry = registry(&fabric);
        assert_eq!(registry.add_importer(label(7), "vpnA").await, None);
        assert_eq!(registry.importer_count(label(7)), 0);
    }
}
