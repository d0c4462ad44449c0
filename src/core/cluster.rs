use crate::database::models::{DuplicateGroup, MatchKind};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// How two photos were linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Identical content hash.
    Exact,
    /// Perceptual distance within threshold.
    Similar,
}

/// Union-find forest over every photo id that has ever matched another id.
/// Merging can only grow groups; nothing here ever splits one.
pub struct ClusterBuilder {
    index_of: HashMap<String, usize>,
    ids: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
    /// True while every edge realized inside the root's set was exact.
    exact_only: Vec<bool>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            index_of: HashMap::new(),
            ids: Vec::new(),
            parent: Vec::new(),
            rank: Vec::new(),
            exact_only: Vec::new(),
        }
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index_of.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        self.index_of.insert(id.to_string(), idx);
        self.parent.push(idx);
        self.rank.push(0);
        self.exact_only.push(true);
        idx
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Record a relationship between two photos. The merged root stays
    /// `exact` only while both sides were exact-only and the new edge is
    /// itself exact.
    pub fn union(&mut self, a: &str, b: &str, kind: EdgeKind) {
        let ia = self.intern(a);
        let ib = self.intern(b);
        let ra = self.find(ia);
        let rb = self.find(ib);

        if ra == rb {
            if kind == EdgeKind::Similar {
                self.exact_only[ra] = false;
            }
            return;
        }

        let exact = self.exact_only[ra] && self.exact_only[rb] && kind == EdgeKind::Exact;
        let root = if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
            rb
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra;
            ra
        } else {
            self.parent[rb] = ra;
            self.rank[ra] += 1;
            ra
        };
        self.exact_only[root] = exact;
    }

    /// Replay a previously persisted group into the forest. Linking members
    /// pairwise-adjacent is enough to reconnect them; the group's stored kind
    /// decides whether the replayed edges count as exact.
    pub fn seed_group(&mut self, members: &[String], kind: MatchKind) {
        let edge = match kind {
            MatchKind::Exact => EdgeKind::Exact,
            MatchKind::Similar => EdgeKind::Similar,
        };
        for pair in members.windows(2) {
            self.union(&pair[0], &pair[1], edge);
        }
    }

    /// Stable group identity: a function of the minimum member id only, so
    /// incremental runs that merely grow a group keep its id.
    pub fn derive_group_id(min_member_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(min_member_id.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("grp_{}", &digest[..16])
    }

    /// Materialize the current partition. Members are ordered by capture time
    /// (then id) so downstream keep policies see oldest-first; groups are
    /// ordered exact-first, then by size, then by id, to keep run output
    /// reproducible.
    pub fn partition(&mut self, capture_times: &HashMap<String, String>) -> Vec<DuplicateGroup> {
        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for idx in 0..self.ids.len() {
            let root = self.find(idx);
            by_root.entry(root).or_default().push(idx);
        }

        let mut groups = Vec::new();
        for (root, indices) in by_root {
            if indices.len() < 2 {
                continue;
            }

            let mut members: Vec<String> =
                indices.iter().map(|&i| self.ids[i].clone()).collect();
            let min_id = members.iter().min().cloned().unwrap_or_default();
            members.sort_by(|a, b| {
                let ta = capture_times.get(a).map(String::as_str).unwrap_or("");
                let tb = capture_times.get(b).map(String::as_str).unwrap_or("");
                ta.cmp(tb).then_with(|| a.cmp(b))
            });

            let match_kind = if self.exact_only[root] {
                MatchKind::Exact
            } else {
                MatchKind::Similar
            };

            groups.push(DuplicateGroup {
                group_id: Self::derive_group_id(&min_id),
                match_kind,
                members,
            });
        }

        groups.sort_by(|a, b| {
            let exact_a = a.match_kind == MatchKind::Exact;
            let exact_b = b.match_kind == MatchKind::Exact;
            exact_b
                .cmp(&exact_a)
                .then_with(|| b.members.len().cmp(&a.members.len()))
                .then_with(|| a.group_id.cmp(&b.group_id))
        });
        groups
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
