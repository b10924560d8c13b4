//! App ownership across horizontally scaled pipeline nodes.
//!
//! An app belongs to exactly one node: `fnv32a(app_id) % node_count ==
//! node_index`. The hash depends only on the app id, so ownership is
//! stable across ticks and process restarts.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv32a(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// This node's position in the pipeline pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    node_count: u32,
    node_index: u32,
}

impl Shard {
    pub fn new(node_count: u32, node_index: u32) -> Self {
        Self {
            node_count,
            node_index,
        }
    }

    /// A single-node pool.
    pub fn single() -> Self {
        Self::new(1, 0)
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    /// Whether this node is responsible for `app_id`.
    ///
    /// A pool of one (or a misconfigured pool of zero) owns everything.
    pub fn owns(&self, app_id: &str) -> bool {
        if self.node_count <= 1 {
            return true;
        }
        fnv32a(app_id.as_bytes()) % self.node_count == self.node_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32a_known_vectors() {
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn single_node_owns_everything() {
        let shard = Shard::single();
        for i in 0..100 {
            assert!(shard.owns(&format!("app-{i}")));
        }
    }

    #[test]
    fn ownership_is_deterministic() {
        let shard = Shard::new(5, 2);
        for i in 0..100 {
            let app = format!("app-{i}");
            assert_eq!(shard.owns(&app), shard.owns(&app));
        }
    }

    #[test]
    fn exactly_one_node_owns_each_app() {
        for node_count in 2..=7u32 {
            for i in 0..500 {
                let app = format!("c0ffee-{i}-guid");
                let owners = (0..node_count)
                    .filter(|idx| Shard::new(node_count, *idx).owns(&app))
                    .count();
                assert_eq!(owners, 1, "app {app} with {node_count} nodes");
            }
        }
    }

    #[test]
    fn every_node_gets_some_apps() {
        let node_count = 4;
        for idx in 0..node_count {
            let shard = Shard::new(node_count, idx);
            let owned = (0..400).filter(|i| shard.owns(&format!("app-{i}"))).count();
            assert!(owned > 0, "node {idx} owns nothing");
        }
    }
}
