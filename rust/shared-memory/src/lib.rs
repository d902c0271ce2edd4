//! Sim Portal - Shared Memory Module
//!
//! Duplex, single-slot-per-direction message channels over POSIX shared
//! memory, connecting a simulation process and an agent process. Each
//! direction hands a single payload slot back and forth through an
//! empty/full pair of CAS-based binary semaphores; a one-shot finished flag
//! rides the same handshake to announce shutdown.

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("sim-portal-shared-memory requires POSIX shared memory (unix targets only)");
    }
}

pub mod channel;
pub mod error;
pub mod message;
pub mod segment;
pub mod semaphore;
pub mod shmvec;
pub mod sync;

pub use channel::*;
pub use error::*;
pub use message::*;
pub use segment::*;
pub use semaphore::*;
pub use shmvec::*;
pub use sync::*;

/// Current version of the segment layout
pub const PORTAL_VERSION: u16 = 1;

/// Magic number identifying an initialized portal segment
pub const PORTAL_MAGIC: u32 = 0x53504F52; // "SPOR"

/// Default segment capacity in bytes
pub const DEFAULT_SEGMENT_SIZE: u32 = 4096;

/// Default element capacity reserved per vector-mode direction
pub const DEFAULT_VECTOR_CAPACITY: u32 = 64;
