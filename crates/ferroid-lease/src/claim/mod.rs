mod allocator;
mod handle;
mod monitor;
mod record;

pub use allocator::*;
pub use handle::{ClaimHandle, ClaimState};
pub use monitor::LeaseMonitor;
pub use record::*;
