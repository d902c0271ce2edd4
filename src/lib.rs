//! Sim Portal
//!
//! Shared-memory message portal between a simulation process and an agent
//! process: a pair of strictly alternating single-slot channels, one per
//! direction, synchronized by CAS-based binary semaphores inside the shared
//! region itself.

pub use sim_portal_shared_memory::*;

/// Re-export common types
pub mod prelude {
    pub use sim_portal_shared_memory::{
        ChannelConfig, Direction, MsgChannel, Role, Segment, ShmError, ShmSafe, ShmVec, SyncBlock,
        VecChannel,
    };
}

/// Current version of the portal crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
