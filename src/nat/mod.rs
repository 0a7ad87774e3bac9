//! TCP flow tracking.

mod allocator;
mod table;

pub use allocator::PortAllocator;
pub use table::{FlowLookup, FlowTable, NatEntry};
