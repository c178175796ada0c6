//! Process-local synchronization primitives: epoch-based reclamation and
//! the backoff helper PMwCAS retry loops spin on.

pub mod backoff;
pub mod ebr;

pub use ebr::{Ebr, EpochBuckets, Guard};
