//! Fixed-capacity vectors backed by segment storage
//!
//! Vector-mode channels pass a whole sequence of structs per hand-off. The
//! element storage lives inside the shared segment, reserved once at
//! construction; `resize` moves the logical length within that reservation
//! and never reallocates. The element count both sides expect is agreed
//! out of band (a configuration contract), not negotiated at runtime.

use crate::{Result, Segment, ShmError, ShmSafe};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// In-segment descriptor for a vector slot.
///
/// `len` is a plain integer: the empty/full handshake serializes every access
/// to it, the same way it serializes access to the elements themselves.
#[repr(C)]
pub(crate) struct VecHeader {
    len: u32,
    cap: u32,
    /// Element storage offset from the segment base.
    elems_off: u32,
}

unsafe impl ShmSafe for VecHeader {}

/// A resizable sequence of POD structs living inside a shared segment.
///
/// All access must happen inside the owning channel's begin/end window.
/// Consumers must not retain references into the backing storage across
/// messages: the producer may resize and rewrite it during its next exclusive
/// write window.
pub struct ShmVec<T: ShmSafe + Copy + Default> {
    header: NonNull<VecHeader>,
    elems: NonNull<T>,
    _marker: PhantomData<T>,
}

// Safety: the pointers target a shared mapping kept alive by the owning
// channel; cross-process access is serialized by the handshake protocol.
unsafe impl<T: ShmSafe + Copy + Default> Send for ShmVec<T> {}

impl<T: ShmSafe + Copy + Default> ShmVec<T> {
    /// Reserve storage for `capacity` elements and publish the descriptor
    /// under `name`. Creator side only.
    pub(crate) fn construct(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        let bytes = size_of::<T>()
            .checked_mul(capacity)
            .ok_or(ShmError::SegmentExhausted {
                requested: usize::MAX,
                remaining: 0,
            })?;
        let elems_off = segment.alloc_raw(bytes, align_of::<T>())?;
        let header = segment.construct(
            name,
            VecHeader {
                len: 0,
                cap: capacity as u32,
                elems_off,
            },
        )?;
        let elems = unsafe { segment.base().add(elems_off as usize) as *mut T };
        Ok(Self {
            header,
            elems: unsafe { NonNull::new_unchecked(elems) },
            _marker: PhantomData,
        })
    }

    /// Locate a vector the creator published under `name`. Attacher side only.
    pub(crate) fn find(segment: &Segment, name: &str) -> Result<Self> {
        let header = segment.find::<VecHeader>(name)?;
        let (cap, elems_off) = unsafe {
            let h = header.as_ptr();
            ((*h).cap as usize, (*h).elems_off as usize)
        };
        let end = elems_off
            .checked_add(cap.saturating_mul(size_of::<T>()))
            .ok_or_else(|| ShmError::Protocol(format!("vector {} overflows its segment", name)))?;
        if end > segment.capacity() {
            return Err(ShmError::Protocol(format!(
                "vector {} storage extends past the segment end",
                name
            )));
        }
        let elems = unsafe { segment.base().add(elems_off) as *mut T };
        Ok(Self {
            header,
            elems: unsafe { NonNull::new_unchecked(elems) },
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.header.as_ptr()).len as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserved element capacity; the resize ceiling.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.header.as_ptr()).cap as usize }
    }

    /// Set the logical length. Growth default-fills the new elements.
    ///
    /// Resizing is part of the producer's exclusive write window; it fails
    /// with [`ShmError::CapacityExceeded`] past the reservation made at
    /// construction.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        let capacity = self.capacity();
        if new_len > capacity {
            return Err(ShmError::CapacityExceeded {
                requested: new_len,
                capacity,
            });
        }
        let old_len = self.len();
        if new_len > old_len {
            let fresh = unsafe {
                std::slice::from_raw_parts_mut(self.elems.as_ptr().add(old_len), new_len - old_len)
            };
            fresh.fill(T::default());
        }
        unsafe {
            (*self.header.as_ptr()).len = new_len as u32;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.elems.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.elems.as_ptr(), self.len()) }
    }
}

impl<T: ShmSafe + Copy + Default> Deref for ShmVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: ShmSafe + Copy + Default> DerefMut for ShmVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}
