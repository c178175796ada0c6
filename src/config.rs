/*!
    # Configuration

    Tunable constants for node sizing, SMO thresholds, and the node
    allocator's pre-fill. Mirrors the original `bzconfig.h` constants;
    the compile-time word-descriptor capacity `W` is a const generic on
    [`crate::pmwcas::PmwcasPool`] instead, since it sizes an in-PM array.
*/

#[derive(Debug, Clone, Copy)]
pub struct BzConfig {
    /// total size, in bytes, of one node's PM block
    pub node_size: u32,
    /// live-size threshold above which `triger_consolidate` demands SPLIT
    pub split_threshold: u32,
    /// live-size threshold at/below which `triger_consolidate` demands MERGE
    pub merge_threshold: u32,
    /// minimum free space a node must retain before CONSOLIDATE is required
    pub min_free: u32,
    /// accumulated `delete_size` above which CONSOLIDATE is required
    pub max_delete: u32,
    /// number of free node blocks the allocator pre-fills at startup
    pub pre_alloc: usize,
    /// capacity of the free-node ring
    pub max_alloc: usize,
    /// number of descriptor slots in the PMwCAS descriptor pool (`D`)
    pub descriptor_pool_size: usize,
    /// bound on the per-operation traversal path stack
    pub max_path_depth: usize,
}

/// `node_size` must exceed `Node::<M>::HEADER_SIZE` for the meta-array
/// capacity `M` the tree is instantiated with — [`Default`] assumes
/// `M = 128` (header 1040 bytes), [`BzConfig::test_config`] assumes
/// `M = 16` (header 144 bytes).
impl Default for BzConfig {
    fn default() -> Self {
        Self {
            node_size: 6144,
            split_threshold: 4096,
            merge_threshold: 2048,
            min_free: 512,
            max_delete: 1024,
            pre_alloc: 128,
            max_alloc: 1024,
            descriptor_pool_size: 4096,
            max_path_depth: 32,
        }
    }
}

impl BzConfig {
    /// the small, fast-converging configuration used by the crate's own test
    /// scenarios (records are fixed-width 8-byte key/value pairs, `M = 16`)
    pub const fn test_config() -> Self {
        const U64: u32 = core::mem::size_of::<u64>() as u32;
        const HEADER: u32 = 16 + 8 * 16;
        Self {
            node_size: HEADER + U64 * 2 * 16,
            split_threshold: U64 * 2 * 6,
            merge_threshold: U64 * 2 * 2,
            min_free: U64 * 2 * 2,
            max_delete: U64 * 2 * 2,
            pre_alloc: 16,
            max_alloc: 64,
            descriptor_pool_size: 64,
            max_path_depth: 32,
        }
    }
}
