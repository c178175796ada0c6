/*!
    # bztree-pm

    A persistent, lock-free key-value index over byte-addressable
    persistent memory.

    Two layers, bottom to top:

    - [`pmwcas`]: a descriptor-based multi-word compare-and-swap that
      makes an update spanning up to `W` independent words appear atomic
      to every reader, and recoverable after a crash mid-commit. Built on
      [`rp`] (durable pointers), [`mem`] (tag-bit target words and the
      fixed-capacity arrays the descriptor pool and traversal paths use),
      and [`pm`] (the byte-addressable region itself).
    - [`bztree`]: a lock-free B+-tree-like index whose structure
      modification operations (consolidate/split/merge) are themselves
      expressed as PMwCAS operations against node-internal and
      parent-slot words, with [`alloc`] supplying fresh node blocks and
      [`sync::Ebr`] reclaiming retired ones once every reader has moved
      on.

    [`bztree::Tree`] is the public entry point; [`config::BzConfig`]
    tunes node sizing and SMO thresholds.
*/

pub mod alloc;
pub mod bztree;
pub mod config;
pub mod error;
pub mod mem;
pub mod pm;
pub mod pmwcas;
pub mod rp;
pub mod sync;

pub use bztree::{ByteCompare, KeyCompare, Tree};
pub use config::BzConfig;
pub use error::{Error, Result};
pub use pm::{HeapPool, PmPool};
