//! Structural statistics for diagnosing trie shape and memory use.

use std::fmt;

/// Accumulated over one subtree walk.
#[derive(Clone, Default, Debug)]
pub struct TrieStats {
    /// Nodes per type tag.
    pub nodes_by_kind: [u64; 9],
    pub total_nodes: u64,
    pub values: u64,
    /// Bytes held by node allocations, block headers included.
    pub node_bytes: u64,
    /// Bytes held by out-of-line key fragment blobs.
    pub external_key_bytes: u64,
    pub max_depth: u64,
}

impl TrieStats {
    pub fn total_bytes(&self) -> u64 {
        self.node_bytes + self.external_key_bytes
    }
}

impl fmt::Display for TrieStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} nodes, {} values, depth {}",
            self.total_nodes, self.values, self.max_depth
        )?;
        writeln!(
            f,
            "{} node bytes + {} external key bytes = {} bytes",
            self.node_bytes,
            self.external_key_bytes,
            self.total_bytes()
        )?;
        let names = [
            "null", "binary", "inline", "basic", "sparse-term", "compressed", "large-key",
            "dense", "sparse-branch",
        ];
        for (name, count) in names.iter().zip(self.nodes_by_kind.iter()) {
            if *count > 0 {
                writeln!(f, "  {name}: {count}")?;
            }
        }
        Ok(())
    }
}
