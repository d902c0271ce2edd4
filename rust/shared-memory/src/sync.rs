//! Per-direction handshake state shared by both processes

use crate::{BinarySemaphore, Direction, ShmSafe};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handshake state for both directions of a channel, plus the shutdown flag.
///
/// One `SyncBlock` lives inside the segment, constructed by the creator and
/// found by the attacher. Each direction owns an independent empty/full
/// semaphore pair; at any instant `empty + full == 1` for a direction, so its
/// slot is either writable by the producer or readable by the consumer, never
/// both and never neither. That invariant is what gives the channel strict
/// alternation and rules out torn reads of the payload.
#[repr(C)]
pub struct SyncBlock {
    sim2agent_empty: BinarySemaphore,
    sim2agent_full: BinarySemaphore,
    agent2sim_empty: BinarySemaphore,
    agent2sim_full: BinarySemaphore,
    finished: AtomicBool,
}

const_assert_eq!(std::mem::size_of::<SyncBlock>(), 5);

unsafe impl ShmSafe for SyncBlock {}

impl SyncBlock {
    /// Fresh handshake state: both slots writable, not finished.
    pub fn new() -> Self {
        Self {
            sim2agent_empty: BinarySemaphore::new(1),
            sim2agent_full: BinarySemaphore::new(0),
            agent2sim_empty: BinarySemaphore::new(1),
            agent2sim_full: BinarySemaphore::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// The "slot is writable" semaphore for a direction.
    pub fn empty(&self, direction: Direction) -> &BinarySemaphore {
        match direction {
            Direction::SimToAgent => &self.sim2agent_empty,
            Direction::AgentToSim => &self.agent2sim_empty,
        }
    }

    /// The "payload is readable" semaphore for a direction.
    pub fn full(&self, direction: Direction) -> &BinarySemaphore {
        match direction {
            Direction::SimToAgent => &self.sim2agent_full,
            Direction::AgentToSim => &self.agent2sim_full,
        }
    }

    /// Raise the one-shot shutdown flag. Never cleared.
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Default for SyncBlock {
    fn default() -> Self {
        Self::new()
    }
}
