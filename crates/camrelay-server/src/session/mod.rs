//! Channel and viewer bookkeeping

pub mod coordinator;
pub mod registry;
pub mod viewers;

pub use coordinator::SessionCoordinator;
pub use registry::{ChannelRecord, ChannelRegistry, ViewerSlot};
pub use viewers::ViewerRegistry;
