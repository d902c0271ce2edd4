//! Payload contracts for objects placed in shared memory

/// Marker trait for types that may be placed inside a shared memory segment.
///
/// The payload slots of a channel are raw in-memory images: no serialization
/// happens, the peer process reads the same bytes this process wrote.
/// Cross-process compatibility therefore requires both binaries to agree on
/// the exact layout (size, field order, padding) of every shared type.
///
/// # Safety
///
/// Implementors must guarantee:
///
/// - the type has a fixed, compiler-independent layout (`#[repr(C)]` or
///   `#[repr(transparent)]` over such a type, or a primitive);
/// - it contains no pointers, references, or any other value that is only
///   meaningful inside a single address space;
/// - any bit pattern left behind by a peer process is safe to read (shared
///   atomics are fine, types with invalid bit patterns generally are not
///   unless the handshake protocol rules them out).
///
/// Heterogeneous message subtypes are expressed as tagged variants with a
/// fixed discriminant layout, matched exhaustively on the receiving side:
///
/// ```
/// use sim_portal_shared_memory::ShmSafe;
///
/// #[repr(C)]
/// #[derive(Clone, Copy, Default)]
/// struct RateSample {
///     throughput: u64,
///     loss: u32,
/// }
/// unsafe impl ShmSafe for RateSample {}
///
/// #[repr(C, u8)]
/// #[derive(Clone, Copy, Default)]
/// enum Command {
///     #[default]
///     Idle,
///     SetRate(u32),
///     Stop,
/// }
/// unsafe impl ShmSafe for Command {}
/// ```
pub unsafe trait ShmSafe: Sized + Send + 'static {}

macro_rules! impl_shm_safe {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $ty {})*
    };
}

impl_shm_safe!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// Which side of the segment lifecycle this process plays.
///
/// Exactly one process creates (and later removes) the region; every other
/// process attaches to it and never removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates the region, constructs the named objects, removes the
    /// region on drop.
    Creator,
    /// Maps an existing region and looks objects up by name.
    Attacher,
}

impl Role {
    pub fn is_creator(self) -> bool {
        matches!(self, Role::Creator)
    }
}

/// One of the two independent flows making up the duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Simulation process to agent process
    SimToAgent,
    /// Agent process to simulation process
    AgentToSim,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_predicates() {
        assert!(Role::Creator.is_creator());
        assert!(!Role::Attacher.is_creator());
    }

    #[test]
    fn test_tagged_variant_is_shm_safe() {
        #[repr(C, u8)]
        #[derive(Clone, Copy, Default, PartialEq, Debug)]
        enum Command {
            #[default]
            Idle,
            SetRate(u32),
        }
        unsafe impl ShmSafe for Command {}

        fn assert_shm_safe<T: ShmSafe>() {}
        assert_shm_safe::<Command>();
        assert_shm_safe::<[u64; 4]>();
        assert_eq!(Command::default(), Command::Idle);
    }
}
