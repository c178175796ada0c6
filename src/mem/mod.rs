//! Byte/word-level helpers shared by the PMwCAS engine and BzTree node
//! layout: tag-bit encoding for target words, and the fixed-capacity
//! stack array used for traversal paths and descriptor entries.

pub mod uarray;
pub mod word;

pub use uarray::UArray;
