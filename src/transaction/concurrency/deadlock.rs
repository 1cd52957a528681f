// Waits-for graph for deadlock detection. Rebuilt from scratch on every
// detector pass; victims are resolved youngest-first so older transactions
// keep their work.

use std::collections::BTreeMap;

use crate::common::types::TxnId;

/// Directed graph over transaction ids: `t1 -> t2` means t1 is blocked
/// behind a granted request of t2.
#[derive(Debug, Default)]
pub struct WaitsForGraph {
    // Adjacency lists kept sorted ascending for deterministic traversal
    edges: BTreeMap<TxnId, Vec<TxnId>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        let list = self.edges.entry(from).or_default();
        if let Err(pos) = list.binary_search(&to) {
            list.insert(pos, to);
        }
    }

    /// Remove every `from -> to` edge
    pub fn remove_edge(&mut self, from: TxnId, to: TxnId) {
        if let Some(list) = self.edges.get_mut(&from) {
            list.retain(|&t| t != to);
        }
    }

    /// Drop a transaction and every edge incident to it
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for list in self.edges.values_mut() {
            list.retain(|&t| t != txn_id);
        }
    }

    /// All edges as (from, to) pairs
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// Find a cycle and return its youngest member (the largest txn id).
    ///
    /// The search roots at the largest transaction id first and runs
    /// depth-first; the cycle is the suffix of the current path from the
    /// first repeated vertex.
    pub fn find_victim(&self) -> Option<TxnId> {
        let mut roots: Vec<TxnId> = self.edges.keys().copied().collect();
        roots.sort_unstable_by(|a, b| b.cmp(a));

        for root in roots {
            let mut path = vec![root];
            if let Some(victim) = self.dfs(&mut path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(&self, path: &mut Vec<TxnId>) -> Option<TxnId> {
        let current = *path.last().unwrap();
        let Some(successors) = self.edges.get(&current) else {
            return None;
        };
        for &next in successors {
            if let Some(pos) = path.iter().position(|&t| t == next) {
                // Back edge: the cycle is path[pos..]
                return path[pos..].iter().copied().max();
            }
            path.push(next);
            if let Some(victim) = self.dfs(path) {
                return Some(victim);
            }
            path.pop();
        }
        None
    }
}
