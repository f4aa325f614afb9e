//! whole-store maintenance operations

mod fsck;
mod stats;

pub use fsck::{fsck, FsckReport, Problem};
pub use stats::{stats, StoreStats};
