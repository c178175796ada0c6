//! The persistent multi-word CAS engine: a descriptor pool plus the
//! install/persist/finalize/install-finals protocol that makes a
//! `W`-word CAS atomic and crash-recoverable.

pub mod descriptor;
pub mod engine;

pub use descriptor::{Md, RecyclePolicy, Wd};
pub use engine::PmwcasPool;
