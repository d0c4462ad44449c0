use crate::core::fingerprint::PerceptualHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two perceptual hash kinds the engine maintains. Distances are only
/// meaningful between hashes of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashKind {
    /// DCT/mean hash ("pHash-style").
    Phash,
    /// Gradient hash ("dHash-style").
    Dhash,
}

struct Node {
    hash: PerceptualHash,
    ids: Vec<String>,
    children: HashMap<u32, Node>,
}

impl Node {
    fn new(hash: PerceptualHash, id: String) -> Self {
        Self {
            hash,
            ids: vec![id],
            children: HashMap::new(),
        }
    }
}

/// BK-tree over Hamming space. Radius queries prune subtrees via the triangle
/// inequality, touching only a small candidate set for thresholds well below
/// the fingerprint width.
struct BkTree {
    root: Option<Node>,
    len: usize,
}

impl BkTree {
    fn new() -> Self {
        Self { root: None, len: 0 }
    }

    fn insert(&mut self, hash: PerceptualHash, id: String) {
        self.len += 1;
        let Some(root) = self.root.as_mut() else {
            self.root = Some(Node::new(hash, id));
            return;
        };

        let mut node = root;
        loop {
            let dist = node.hash.distance(&hash);
            if dist == 0 {
                node.ids.push(id);
                return;
            }
            // HashMap::entry would borrow `node` for the whole loop body, so
            // probe first and descend on the reborrow.
            if node.children.contains_key(&dist) {
                node = node.children.get_mut(&dist).unwrap();
            } else {
                node.children.insert(dist, Node::new(hash, id));
                return;
            }
        }
    }

    fn query(&self, hash: &PerceptualHash, threshold: u32) -> Vec<(String, u32)> {
        let mut hits = Vec::new();
        let Some(root) = self.root.as_ref() else {
            return hits;
        };

        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let dist = node.hash.distance(hash);
            if dist <= threshold {
                for id in &node.ids {
                    hits.push((id.clone(), dist));
                }
            }
            let low = dist.saturating_sub(threshold);
            let high = dist + threshold;
            for (edge, child) in &node.children {
                if *edge >= low && *edge <= high {
                    stack.push(child);
                }
            }
        }
        hits
    }
}

/// In-memory index over all known perceptual fingerprints, one tree per hash
/// kind. Rebuilt from the store each run; purely a performance structure.
pub struct SimilarityIndex {
    phash_tree: BkTree,
    dhash_tree: BkTree,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            phash_tree: BkTree::new(),
            dhash_tree: BkTree::new(),
        }
    }

    pub fn insert(&mut self, id: &str, phash: PerceptualHash, dhash: PerceptualHash) {
        self.phash_tree.insert(phash, id.to_string());
        self.dhash_tree.insert(dhash, id.to_string());
    }

    /// All ids whose `kind` fingerprint is within Hamming distance
    /// `threshold` of `hash`, with their distances.
    pub fn query(&self, hash: &PerceptualHash, kind: HashKind, threshold: u32) -> Vec<(String, u32)> {
        match kind {
            HashKind::Phash => self.phash_tree.query(hash, threshold),
            HashKind::Dhash => self.dhash_tree.query(hash, threshold),
        }
    }

    pub fn len(&self) -> usize {
        self.phash_tree.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}
