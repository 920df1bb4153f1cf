//! Route table learnt from neighbour advertisements.

use crate::identity::Iid;
use crate::transport::ConnectionId;
use std::collections::HashMap;

/// One way of reaching a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    /// Adjacent connection to forward through.
    pub next_hop: ConnectionId,
    /// Intermediate instances between us and the destination.
    pub hops: u8,
    /// Sequence of the advertisement that last changed this neighbour's
    /// contribution.
    pub seq: u64,
}

/// Routes keyed by destination, plus the reverse index by neighbour.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<Iid, Vec<RouteEntry>>,
    by_neighbor: HashMap<ConnectionId, HashMap<Iid, u8>>,
    seq: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best learnt route: lowest hop count, ties to the neighbour whose
    /// advertised set changed most recently.
    ///
    /// Repeating an unchanged advertisement keeps its sequence, so periodic
    /// re-advertisement never flips a tie between equal routes.
    pub fn best(&self, dest: Iid) -> Option<RouteEntry> {
        self.routes.get(&dest)?.iter().copied().min_by(|a, b| {
            a.hops.cmp(&b.hops).then_with(|| b.seq.cmp(&a.seq))
        })
    }

    /// Replace every entry learnt from `neighbor`.
    ///
    /// `reachable` carries the neighbour's own hop counts; entries are
    /// stored one hop further away. Entries for `local`, and entries at or
    /// beyond `max_hops` once stored, are ignored. Returns whether the
    /// neighbour's contribution changed.
    pub fn advertise(
        &mut self,
        neighbor: ConnectionId,
        reachable: &[(Iid, u8)],
        local: Iid,
        max_hops: u8,
    ) -> bool {
        let mut learnt: HashMap<Iid, u8> = HashMap::new();
        for &(iid, hops) in reachable {
            let hops = hops.saturating_add(1);
            if iid == local || iid.is_unset() || hops >= max_hops {
                continue;
            }
            learnt
                .entry(iid)
                .and_modify(|h| *h = (*h).min(hops))
                .or_insert(hops);
        }

        let previous = self.by_neighbor.get(&neighbor);
        if previous == Some(&learnt) || (previous.is_none() && learnt.is_empty()) {
            return false;
        }

        self.remove_neighbor(neighbor);
        self.seq += 1;
        let seq = self.seq;
        for (&iid, &hops) in &learnt {
            self.routes.entry(iid).or_default().push(RouteEntry {
                next_hop: neighbor,
                hops,
                seq,
            });
        }
        if !learnt.is_empty() {
            self.by_neighbor.insert(neighbor, learnt);
        }
        true
    }

    /// Drop every entry learnt from `neighbor`, returning whether any existed.
    pub fn remove_neighbor(&mut self, neighbor: ConnectionId) -> bool {
        let Some(learnt) = self.by_neighbor.remove(&neighbor) else {
            return false;
        };
        for iid in learnt.keys() {
            if let Some(entries) = self.routes.get_mut(iid) {
                entries.retain(|e| e.next_hop != neighbor);
                if entries.is_empty() {
                    self.routes.remove(iid);
                }
            }
        }
        true
    }

    /// Best route per destination whose next hop is not `exclude`.
    pub fn reachable_except(&self, exclude: ConnectionId) -> Vec<(Iid, u8)> {
        let mut out: Vec<(Iid, u8)> = self
            .routes
            .keys()
            .filter_map(|&iid| {
                let best = self.best(iid)?;
                (best.next_hop != exclude).then_some((iid, best.hops))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Number of distinct destinations.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
