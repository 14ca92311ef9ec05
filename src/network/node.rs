use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use std::collections::HashSet;

/// Peer registry: addresses of nodes believed reachable. Membership only,
/// no ordering.
#[derive(Default)]
pub struct Nodes {
    inner: RwLock<HashSet<String>>,
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes::default()
    }

    /// Returns true if the address was not known before.
    pub fn add_node(&self, addr: &str) -> bool {
        self.inner.write().insert(addr.to_string())
    }

    pub fn evict_node(&self, addr: &str) -> bool {
        self.inner.write().remove(addr)
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.inner.read().contains(addr)
    }

    pub fn random_node(&self) -> Option<String> {
        self.inner
            .read()
            .iter()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn get_nodes(&self) -> Vec<String> {
        self.inner.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
