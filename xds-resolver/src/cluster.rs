//! The reference-counted registry of selectable clusters.
//!
//! Every cluster carries one reference for its membership in the currently
//! published routing config plus one reference per in-flight call routed
//! to it. A cluster stays listed in the emitted load-balancing config
//! until both kinds of references are gone, so a call started against an
//! older snapshot can still finish against a cluster the latest config no
//! longer names.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub(crate) struct ClusterRefTable {
    refs: DashMap<String, Arc<AtomicU32>>,
}

impl ClusterRefTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes a call reference. Fails when the cluster is absent or already
    /// drained to zero; the caller then re-reads the routing snapshot and
    /// retries, because losing this race means the snapshot it matched
    /// against has been superseded.
    pub(crate) fn retain(&self, cluster: &str) -> bool {
        let Some(count) = self.refs.get(cluster).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        let mut current = count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match count.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops a call reference. Returns true when the count reached zero;
    /// the caller must then run [`Self::remove_if_unreferenced`] on the
    /// synchronization context.
    pub(crate) fn release(&self, cluster: &str) -> bool {
        match self.refs.get(cluster) {
            Some(entry) => entry.value().fetch_sub(1, Ordering::AcqRel) == 1,
            None => false,
        }
    }

    /// Removes the entry if its count is still zero, returning whether it
    /// was removed. Runs on the synchronization context; the count is
    /// re-read under the map guard because a membership update may have
    /// revived the entry after the releasing call observed zero.
    pub(crate) fn remove_if_unreferenced(&self, cluster: &str) -> bool {
        self.refs
            .remove_if(cluster, |_, count| count.load(Ordering::Acquire) == 0)
            .is_some()
    }

    /// Adds a membership reference, creating the entry when absent.
    /// Returns true when the cluster is new to the table. Runs on the
    /// synchronization context.
    pub(crate) fn add_membership(&self, cluster: &str) -> bool {
        match self.refs.entry(cluster.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().fetch_add(1, Ordering::AcqRel);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(AtomicU32::new(1)));
                true
            }
        }
    }

    /// Drops a membership reference, removing the entry when it reaches
    /// zero. Returns true when the entry was removed. Runs on the
    /// synchronization context.
    pub(crate) fn drop_membership(&self, cluster: &str) -> bool {
        let Some(count) = self.refs.get(cluster).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        if count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.refs
                .remove_if(cluster, |_, count| count.load(Ordering::Acquire) == 0)
                .is_some()
        } else {
            false
        }
    }

    /// Names of every cluster currently referenced, in no particular
    /// order.
    pub(crate) fn cluster_names(&self) -> Vec<String> {
        self.refs.iter().map(|entry| entry.key().clone()).collect()
    }

    #[cfg(test)]
    fn count(&self, cluster: &str) -> Option<u32> {
        self.refs
            .get(cluster)
            .map(|entry| entry.value().load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_fails_on_absent_cluster() {
        let table = ClusterRefTable::new();
        assert!(!table.retain("cluster-foo"));
    }

    #[test]
    fn retain_and_release_track_call_references() {
        let table = ClusterRefTable::new();
        assert!(table.add_membership("cluster-foo"));
        assert!(table.retain("cluster-foo"));
        assert_eq!(table.count("cluster-foo"), Some(2));
        assert!(!table.release("cluster-foo"));
        assert_eq!(table.count("cluster-foo"), Some(1));
    }

    #[test]
    fn membership_drop_keeps_cluster_alive_for_inflight_call() {
        let table = ClusterRefTable::new();
        table.add_membership("cluster-foo");
        assert!(table.retain("cluster-foo"));
        // Config update removes the cluster; the call still holds it.
        assert!(!table.drop_membership("cluster-foo"));
        assert_eq!(table.count("cluster-foo"), Some(1));
        assert!(table.cluster_names().contains(&"cluster-foo".to_string()));
        // Call finishes.
        assert!(table.release("cluster-foo"));
        assert!(table.remove_if_unreferenced("cluster-foo"));
        assert!(table.cluster_names().is_empty());
    }

    #[test]
    fn retain_fails_once_drained_to_zero() {
        let table = ClusterRefTable::new();
        table.add_membership("cluster-foo");
        assert!(table.drop_membership("cluster-foo"));
        assert!(!table.retain("cluster-foo"));
    }

    #[test]
    fn removal_recheck_spares_revived_entry() {
        let table = ClusterRefTable::new();
        table.add_membership("cluster-foo");
        table.retain("cluster-foo");
        table.drop_membership("cluster-foo");
        assert!(table.release("cluster-foo"));
        // Before the deferred removal runs, a membership update brings the
        // cluster back.
        assert!(!table.add_membership("cluster-foo"));
        assert!(!table.remove_if_unreferenced("cluster-foo"));
        assert_eq!(table.count("cluster-foo"), Some(1));
    }

    #[test]
    fn concurrent_retains_and_releases_balance_out() {
        use std::thread;
        let table = Arc::new(ClusterRefTable::new());
        table.add_membership("cluster-foo");
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(table.retain("cluster-foo"));
                        assert!(!table.release("cluster-foo"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(table.count("cluster-foo"), Some(1));
    }
}
