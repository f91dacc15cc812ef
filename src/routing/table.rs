//! Link-state routing table
//!
//! Maintains the directed advertisement graph and derives, after every
//! mutation, the shortest-path reachability map from the local peer. Each
//! mutation returns the delta between the old and new maps so the router can
//! notify its delegate exactly once per affected peer.

use crate::error::{MeshError, Result};
use crate::routing::{HopTree, PeerId};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// Route derived for one peer: the neighbor to forward through and the total
/// path cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// First hop on the shortest path
    pub next_hop: PeerId,
    /// Total weight of the shortest path
    pub cost: u32,
}

/// Delta between two consecutive reachability maps.
///
/// The three sets are disjoint; a peer whose status changed appears in
/// exactly one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTableChange {
    /// Peers reachable now that were not before, with their new route
    pub now_reachable: Vec<(PeerId, Route)>,
    /// Peers no longer reachable
    pub now_unreachable: Vec<PeerId>,
    /// Peers whose next hop or cost changed, with old and new routes
    pub route_changed: Vec<(PeerId, Route, Route)>,
}

impl RoutingTableChange {
    /// Whether the update changed nothing
    pub fn is_empty(&self) -> bool {
        self.now_reachable.is_empty()
            && self.now_unreachable.is_empty()
            && self.route_changed.is_empty()
    }
}

/// Weighted directed graph of advertised adjacencies plus the derived
/// reachability map.
///
/// An edge `u → v` with weight `w` exists iff `u` most recently advertised
/// `v` as a neighbor with cost `w`. The local peer's edges come from direct
/// neighbor observation and are never overwritten by received advertisements.
pub struct LinkStateTable {
    local: PeerId,
    edges: HashMap<PeerId, HashMap<PeerId, u32>>,
    reachable: HashMap<PeerId, Route>,
}

impl LinkStateTable {
    /// Create a table for the given local peer
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            edges: HashMap::new(),
            reachable: HashMap::new(),
        }
    }

    /// Set or update the local edge to a direct neighbor
    pub fn neighbor_update(&mut self, peer: PeerId, cost: u32) -> RoutingTableChange {
        self.edges.entry(self.local).or_default().insert(peer, cost);
        self.recompute()
    }

    /// Remove the local edge to a neighbor
    pub fn neighbor_removal(&mut self, peer: PeerId) -> RoutingTableChange {
        if let Some(local_edges) = self.edges.get_mut(&self.local) {
            local_edges.remove(&peer);
        }
        self.recompute()
    }

    /// Replace `origin`'s advertised outgoing edge set.
    ///
    /// Advertisements claiming to be from the local peer are ignored; local
    /// edges are authoritative from direct observation only.
    pub fn link_state_update(
        &mut self,
        origin: PeerId,
        neighbors: &[(PeerId, u32)],
    ) -> RoutingTableChange {
        if origin == self.local {
            return RoutingTableChange::default();
        }
        let edge_set: HashMap<PeerId, u32> = neighbors.iter().copied().collect();
        self.edges.insert(origin, edge_set);
        self.recompute()
    }

    /// The local peer's current neighbor-cost list, for broadcast
    pub fn link_state_information(&self) -> Vec<(PeerId, u32)> {
        let mut info: Vec<(PeerId, u32)> = self
            .edges
            .get(&self.local)
            .map(|edges| edges.iter().map(|(p, c)| (*p, *c)).collect())
            .unwrap_or_default();
        info.sort_by_key(|(p, _)| *p);
        info
    }

    /// Current route to a peer, if reachable
    pub fn route_to(&self, peer: &PeerId) -> Option<Route> {
        self.reachable.get(peer).copied()
    }

    /// Snapshot of the whole reachability map
    pub fn reachability(&self) -> HashMap<PeerId, Route> {
        self.reachable.clone()
    }

    /// Union of the shortest paths to every destination, rooted at the local
    /// peer.
    ///
    /// Fails with `NoRoute` listing every unreachable destination; a partial
    /// tree is never returned.
    pub fn hop_tree(&self, destinations: &BTreeSet<PeerId>) -> Result<HopTree> {
        let (_, prev) = self.shortest_paths();
        let unreachable: Vec<PeerId> = destinations
            .iter()
            .filter(|d| **d != self.local && !prev.contains_key(d))
            .copied()
            .collect();
        if !unreachable.is_empty() {
            return Err(MeshError::NoRoute(unreachable));
        }

        let mut tree = HopTree::leaf(self.local);
        for dest in destinations {
            if *dest == self.local {
                continue;
            }
            let mut path = vec![*dest];
            let mut cursor = *dest;
            while cursor != self.local {
                cursor = prev[&cursor];
                path.push(cursor);
            }
            path.reverse();
            tree.merge_path(&path);
        }
        Ok(tree)
    }

    fn recompute(&mut self) -> RoutingTableChange {
        let (dist, prev) = self.shortest_paths();

        let mut fresh: HashMap<PeerId, Route> = HashMap::with_capacity(dist.len());
        for (peer, cost) in &dist {
            if *peer == self.local {
                continue;
            }
            // Walk back to the vertex adjacent to the local peer.
            let mut hop = *peer;
            while prev[&hop] != self.local {
                hop = prev[&hop];
            }
            fresh.insert(*peer, Route {
                next_hop: hop,
                cost: *cost,
            });
        }

        let mut change = RoutingTableChange::default();
        for (peer, route) in &fresh {
            match self.reachable.get(peer) {
                None => change.now_reachable.push((*peer, *route)),
                Some(old) if old != route => change.route_changed.push((*peer, *old, *route)),
                Some(_) => {}
            }
        }
        for peer in self.reachable.keys() {
            if !fresh.contains_key(peer) {
                change.now_unreachable.push(*peer);
            }
        }
        change.now_reachable.sort_by_key(|(p, _)| *p);
        change.now_unreachable.sort();
        change.route_changed.sort_by_key(|(p, _, _)| *p);

        self.reachable = fresh;
        change
    }

    /// Dijkstra from the local peer over the directed advertisement graph.
    ///
    /// Heap entries carry the first hop of the path that produced them;
    /// ordering by `(cost, first_hop, vertex)` settles equal-cost paths on
    /// the lexicographically smallest next hop, deterministically.
    fn shortest_paths(&self) -> (HashMap<PeerId, u32>, HashMap<PeerId, PeerId>) {
        let mut dist: HashMap<PeerId, u32> = HashMap::new();
        let mut prev: HashMap<PeerId, PeerId> = HashMap::new();
        let mut settled: BTreeSet<PeerId> = BTreeSet::new();
        // (cost, first_hop, vertex, predecessor)
        let mut heap: BinaryHeap<Reverse<(u32, PeerId, PeerId, PeerId)>> = BinaryHeap::new();

        dist.insert(self.local, 0);
        if let Some(local_edges) = self.edges.get(&self.local) {
            for (neighbor, cost) in local_edges {
                heap.push(Reverse((*cost, *neighbor, *neighbor, self.local)));
            }
        }

        while let Some(Reverse((cost, first_hop, vertex, predecessor))) = heap.pop() {
            if settled.contains(&vertex) {
                continue;
            }
            settled.insert(vertex);
            dist.insert(vertex, cost);
            prev.insert(vertex, predecessor);

            if let Some(out_edges) = self.edges.get(&vertex) {
                for (next, weight) in out_edges {
                    if *next == self.local || settled.contains(next) {
                        continue;
                    }
                    heap.push(Reverse((
                        cost.saturating_add(*weight),
                        first_hop,
                        *next,
                        vertex,
                    )));
                }
            }
        }

        dist.remove(&self.local);
        (dist, prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 16])
    }

    fn route(next_hop: PeerId, cost: u32) -> Route {
        Route { next_hop, cost }
    }

    #[test]
    fn direct_neighbor_becomes_reachable() {
        let mut table = LinkStateTable::new(peer(0));
        let change = table.neighbor_update(peer(1), 5);
        assert_eq!(change.now_reachable, vec![(peer(1), route(peer(1), 5))]);
        assert!(change.now_unreachable.is_empty());
        assert!(change.route_changed.is_empty());
        assert_eq!(table.route_to(&peer(1)), Some(route(peer(1), 5)));
    }

    #[test]
    fn neighbor_removal_loses_downstream_peers() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        table.link_state_update(peer(1), &[(peer(2), 1)]);
        assert_eq!(table.route_to(&peer(2)), Some(route(peer(1), 2)));

        let change = table.neighbor_removal(peer(1));
        assert_eq!(change.now_unreachable, vec![peer(1), peer(2)]);
        assert!(table.route_to(&peer(2)).is_none());
    }

    #[test]
    fn cost_improvement_is_a_route_change() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 10);
        let change = table.neighbor_update(peer(1), 3);
        assert_eq!(
            change.route_changed,
            vec![(peer(1), route(peer(1), 10), route(peer(1), 3))]
        );
    }

    #[test]
    fn link_state_replaces_previous_edge_set() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        table.link_state_update(peer(1), &[(peer(2), 1), (peer(3), 1)]);
        assert!(table.route_to(&peer(2)).is_some());
        assert!(table.route_to(&peer(3)).is_some());

        // New advertisement drops peer(3).
        let change = table.link_state_update(peer(1), &[(peer(2), 1)]);
        assert_eq!(change.now_unreachable, vec![peer(3)]);
        assert!(table.route_to(&peer(2)).is_some());
    }

    #[test]
    fn local_origin_advertisement_is_ignored() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        let change = table.link_state_update(peer(0), &[(peer(9), 1)]);
        assert!(change.is_empty());
        assert!(table.route_to(&peer(9)).is_none());
        assert_eq!(table.link_state_information(), vec![(peer(1), 1)]);
    }

    #[test]
    fn equal_cost_tie_breaks_on_smaller_next_hop() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(2), 1);
        table.neighbor_update(peer(4), 1);
        table.link_state_update(peer(2), &[(peer(7), 1)]);
        let change = table.link_state_update(peer(4), &[(peer(7), 1)]);
        // Both paths cost 2; the route must prefer next hop peer(2).
        assert!(change.is_empty());
        assert_eq!(table.route_to(&peer(7)), Some(route(peer(2), 2)));
    }

    #[test]
    fn ring_reroutes_after_edge_removal() {
        // A(0) - B(1) - C(2) - D(3) - A, unit costs. From A, the route to C
        // ties at cost 2 via B or D and must pick B (smaller id). When B
        // drops C, A reroutes via D.
        let (a, b, c, d) = (peer(1), peer(2), peer(3), peer(4));
        let mut table = LinkStateTable::new(a);
        table.neighbor_update(b, 1);
        table.neighbor_update(d, 1);
        table.link_state_update(b, &[(a, 1), (c, 1)]);
        table.link_state_update(d, &[(a, 1), (c, 1)]);
        table.link_state_update(c, &[(b, 1), (d, 1)]);
        assert_eq!(table.route_to(&c), Some(route(b, 2)));

        let change = table.link_state_update(b, &[(a, 1)]);
        assert_eq!(change.route_changed, vec![(c, route(b, 2), route(d, 2))]);
        assert_eq!(table.route_to(&c), Some(route(d, 2)));
    }

    #[test]
    fn asymmetric_advertisements_stay_directed() {
        // peer(1) advertises peer(2), but not vice versa: the edge is one-way.
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        table.link_state_update(peer(1), &[(peer(2), 1)]);
        table.link_state_update(peer(2), &[]);
        assert_eq!(table.route_to(&peer(2)), Some(route(peer(1), 2)));
    }

    #[test]
    fn hop_tree_merges_shared_prefix() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        table.link_state_update(peer(1), &[(peer(2), 1), (peer(3), 1)]);

        let dests: BTreeSet<PeerId> = [peer(2), peer(3)].into_iter().collect();
        let tree = table.hop_tree(&dests).unwrap();
        assert_eq!(tree.id, peer(0));
        assert_eq!(tree.children.len(), 1);
        let relay = &tree.children[0];
        assert_eq!(relay.id, peer(1));
        assert_eq!(relay.children.len(), 2);
    }

    #[test]
    fn hop_tree_with_direct_children() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);
        table.neighbor_update(peer(2), 1);

        let dests: BTreeSet<PeerId> = [peer(1), peer(2)].into_iter().collect();
        let tree = table.hop_tree(&dests).unwrap();
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children.iter().all(|c| c.is_leaf()));
    }

    #[test]
    fn hop_tree_fails_whole_on_any_unreachable() {
        let mut table = LinkStateTable::new(peer(0));
        table.neighbor_update(peer(1), 1);

        let dests: BTreeSet<PeerId> = [peer(1), peer(9)].into_iter().collect();
        match table.hop_tree(&dests) {
            Err(MeshError::NoRoute(missing)) => assert_eq!(missing, vec![peer(9)]),
            other => panic!("expected NoRoute, got {:?}", other.map(|_| ())),
        }
    }

    /// P1: reachability equals a from-scratch recomputation after any update
    /// sequence. P2: replaying deltas over the starting map reproduces the
    /// final map.
    #[test]
    fn deltas_replay_to_final_reachability() {
        let mut table = LinkStateTable::new(peer(0));
        let mut replayed: HashMap<PeerId, Route> = HashMap::new();
        let mut apply = |replayed: &mut HashMap<PeerId, Route>, change: RoutingTableChange| {
            for (p, r) in change.now_reachable {
                assert!(replayed.insert(p, r).is_none());
            }
            for p in change.now_unreachable {
                assert!(replayed.remove(&p).is_some());
            }
            for (p, old, new) in change.route_changed {
                assert_eq!(replayed.insert(p, new), Some(old));
            }
        };

        apply(&mut replayed, table.neighbor_update(peer(1), 2));
        apply(&mut replayed, table.neighbor_update(peer(2), 4));
        apply(
            &mut replayed,
            table.link_state_update(peer(1), &[(peer(3), 1), (peer(2), 1)]),
        );
        apply(
            &mut replayed,
            table.link_state_update(peer(3), &[(peer(4), 5)]),
        );
        apply(&mut replayed, table.neighbor_update(peer(1), 9));
        apply(&mut replayed, table.link_state_update(peer(1), &[]));
        apply(&mut replayed, table.neighbor_removal(peer(2)));

        assert_eq!(replayed, table.reachability());

        // From-scratch oracle: rebuild a fresh table with the same final
        // graph and compare maps.
        let mut oracle = LinkStateTable::new(peer(0));
        oracle.neighbor_update(peer(1), 9);
        oracle.link_state_update(peer(1), &[]);
        oracle.link_state_update(peer(3), &[(peer(4), 5)]);
        assert_eq!(oracle.reachability(), table.reachability());
    }
}
