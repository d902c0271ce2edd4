//! Named shared memory segments with an in-segment object table
//!
//! A [`Segment`] maps a named POSIX shared memory region into the calling
//! process exactly once. The region starts with a [`SegmentHeader`] holding a
//! fixed table of named objects and a bump-allocation offset, which together
//! play the role of a managed segment: the creator constructs typed objects
//! under string names, attachers look the same names up and receive pointers
//! into the identical physical memory.

use crate::{Result, Role, ShmError, ShmSafe};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};
use std::ptr::{self, addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Maximum named objects per segment.
const MAX_NAMED_OBJECTS: usize = 16;
/// Maximum name length for an object inside a segment.
const MAX_OBJECT_NAME: usize = 47;

/// Smallest region that can hold the header plus some payload.
const MIN_SEGMENT_SIZE: usize = size_of::<SegmentHeader>() + 64;
/// Largest region accepted, 1 GiB.
const MAX_SEGMENT_SIZE: usize = 1024 * 1024 * 1024;

/// One slot in the segment's object table.
///
/// Written only by the creator; the `ready` flag is the publication point,
/// stored with release ordering after every other field is in place.
#[repr(C)]
struct ObjectEntry {
    name: [u8; MAX_OBJECT_NAME],
    name_len: u8,
    offset: u32,
    size: u32,
    ready: AtomicU32,
    _pad: [u8; 4],
}

const_assert_eq!(size_of::<ObjectEntry>(), 64);

/// Header at the start of every segment.
#[repr(C)]
struct SegmentHeader {
    /// Published last by the creator, validated first by attachers.
    magic: AtomicU32,
    version: u16,
    _pad: u16,
    capacity: u32,
    /// Next free byte; creator-exclusive.
    alloc_off: u32,
    entries: [ObjectEntry; MAX_NAMED_OBJECTS],
}

const_assert_eq!(size_of::<SegmentHeader>(), 1040);

/// A named shared memory region mapped into this process.
pub struct Segment {
    name: String,
    capacity: usize,
    ptr: NonNull<u8>,
    fd: std::os::unix::io::RawFd,
    role: Role,
}

// Safety: the mapping is valid for the life of the Segment, and all shared
// mutation goes through atomics or is serialized by the channel protocol.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new region of `capacity` bytes under `name`.
    ///
    /// Fails with [`ShmError::RegionExists`] if a region of the same name is
    /// already present; a creator recovering from a crashed previous run must
    /// call [`Segment::remove`] first.
    pub fn create(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;
        validate_region_size(capacity)?;

        let (ptr, fd) = platform::create_region(&name, capacity)?;

        let segment = Self {
            name,
            capacity,
            ptr,
            fd,
            role: Role::Creator,
        };
        segment.init_header();
        debug!(segment = %segment.name, capacity, "created shared memory segment");
        Ok(segment)
    }

    /// Map an existing region.
    ///
    /// Fails with [`ShmError::RegionNotFound`] if no such region exists. The
    /// creator must have finished creating the region first; that ordering is
    /// a process start-up contract, not something this call polls for.
    pub fn attach(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;

        let (ptr, mapped_size, fd) = platform::open_region(&name)?;

        let segment = Self {
            name,
            capacity: mapped_size,
            ptr,
            fd,
            role: Role::Attacher,
        };
        segment.validate_header(mapped_size)?;
        debug!(segment = %segment.name, capacity = segment.capacity, "attached shared memory segment");
        Ok(segment)
    }

    /// Remove a named region from the OS namespace.
    ///
    /// Used by creators to clear a stale region left behind by an ungraceful
    /// shutdown before creating a fresh one.
    pub fn remove(name: &str) -> Result<()> {
        validate_region_name(name)?;
        platform::remove_region(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Place a new `T` in the segment under `object_name`.
    ///
    /// Only the creator constructs; attachers use [`Segment::find`]. The
    /// returned pointer stays valid for the life of this mapping.
    pub fn construct<T: ShmSafe>(&self, object_name: &str, value: T) -> Result<NonNull<T>> {
        if !self.role.is_creator() {
            return Err(ShmError::Role("creating"));
        }
        let name_bytes = validate_object_name(object_name)?;

        let header = self.header();
        // The creator is the only writer of the table, and single-threaded
        // with respect to this segment, so plain scans are race-free here.
        let mut free_slot = None;
        for index in 0..MAX_NAMED_OBJECTS {
            let entry = unsafe { self.entry_ptr(header, index) };
            if unsafe { (*entry).ready.load(Ordering::Relaxed) } == 0 {
                free_slot.get_or_insert(index);
            } else if unsafe { entry_name_matches(entry, name_bytes) } {
                return Err(ShmError::ObjectExists(object_name.to_string()));
            }
        }
        let slot = free_slot.ok_or(ShmError::ObjectTableFull(MAX_NAMED_OBJECTS))?;

        let offset = self.alloc_raw(size_of::<T>(), align_of::<T>())?;
        let object_ptr = unsafe { self.ptr.as_ptr().add(offset as usize) as *mut T };
        unsafe {
            ptr::write(object_ptr, value);

            let entry = self.entry_ptr(header, slot);
            (&mut (*entry).name)[..name_bytes.len()].copy_from_slice(name_bytes);
            (*entry).name_len = name_bytes.len() as u8;
            (*entry).offset = offset;
            (*entry).size = size_of::<T>() as u32;
            (*entry).ready.store(1, Ordering::Release);
        }

        debug!(
            segment = %self.name,
            object = %object_name,
            offset,
            size = size_of::<T>(),
            "constructed named object"
        );
        Ok(unsafe { NonNull::new_unchecked(object_ptr) })
    }

    /// Locate a previously constructed `T` by name.
    ///
    /// Only attachers look objects up. Fails with
    /// [`ShmError::ObjectNotFound`] if the creator has not constructed the
    /// name yet; the remedy is process start-up ordering, not retrying.
    pub fn find<T: ShmSafe>(&self, object_name: &str) -> Result<NonNull<T>> {
        if self.role.is_creator() {
            return Err(ShmError::Role("attaching"));
        }
        let name_bytes = validate_object_name(object_name)?;

        let header = self.header();
        for index in 0..MAX_NAMED_OBJECTS {
            let entry = unsafe { self.entry_ptr(header, index) };
            // Acquire pairs with the creator's release publish; entry fields
            // may only be read once the flag is observed.
            if unsafe { (*entry).ready.load(Ordering::Acquire) } == 0 {
                continue;
            }
            if !unsafe { entry_name_matches(entry, name_bytes) } {
                continue;
            }
            let (offset, size) = unsafe { ((*entry).offset as usize, (*entry).size as usize) };
            if size != size_of::<T>() {
                return Err(ShmError::SizeMismatch {
                    name: object_name.to_string(),
                    expected: size_of::<T>(),
                    found: size,
                });
            }
            let object_ptr = unsafe { self.ptr.as_ptr().add(offset) as *mut T };
            return Ok(unsafe { NonNull::new_unchecked(object_ptr) });
        }
        Err(ShmError::ObjectNotFound(object_name.to_string()))
    }

    /// Bump-allocate `size` bytes aligned to `align`, without a table entry.
    ///
    /// Creator-only; used for vector element storage. Returns the offset from
    /// the segment base.
    pub(crate) fn alloc_raw(&self, size: usize, align: usize) -> Result<u32> {
        if !self.role.is_creator() {
            return Err(ShmError::Role("creating"));
        }
        let header = self.header();
        let current = unsafe { (*header).alloc_off } as usize;
        let aligned = align_up(current, align);
        let end = aligned.checked_add(size).ok_or(ShmError::SegmentExhausted {
            requested: size,
            remaining: self.capacity.saturating_sub(current),
        })?;
        if end > self.capacity {
            return Err(ShmError::SegmentExhausted {
                requested: size,
                remaining: self.capacity.saturating_sub(aligned.min(self.capacity)),
            });
        }
        unsafe {
            (*header).alloc_off = end as u32;
        }
        Ok(aligned as u32)
    }

    /// Snapshot of the segment's allocation state.
    pub fn stats(&self) -> SegmentStats {
        let header = self.header();
        let used = unsafe { (*header).alloc_off } as usize;
        let mut objects = 0;
        for index in 0..MAX_NAMED_OBJECTS {
            let entry = unsafe { self.entry_ptr(header, index) };
            if unsafe { (*entry).ready.load(Ordering::Acquire) } != 0 {
                objects += 1;
            }
        }
        SegmentStats {
            name: self.name.clone(),
            capacity: self.capacity,
            used,
            objects,
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn header(&self) -> *mut SegmentHeader {
        self.ptr.as_ptr() as *mut SegmentHeader
    }

    /// Safety: `header` must be this segment's mapped header and `index`
    /// must be within the object table.
    unsafe fn entry_ptr(&self, header: *mut SegmentHeader, index: usize) -> *mut ObjectEntry {
        addr_of_mut!((*header).entries).cast::<ObjectEntry>().add(index)
    }

    fn init_header(&self) {
        let header = self.header();
        unsafe {
            // ftruncate zero-filled the region, so the table starts clean.
            (*header).version = crate::PORTAL_VERSION;
            (*header).capacity = self.capacity as u32;
            (*header).alloc_off = align_up(size_of::<SegmentHeader>(), 16) as u32;
            // Publish last: attachers validate magic before anything else.
            (*header).magic.store(crate::PORTAL_MAGIC, Ordering::Release);
        }
    }

    fn validate_header(&self, mapped_size: usize) -> Result<()> {
        let header = self.header();
        if mapped_size < size_of::<SegmentHeader>() {
            return Err(ShmError::Protocol(format!(
                "region {} too small for a segment header",
                self.name
            )));
        }
        let magic = unsafe { (*header).magic.load(Ordering::Acquire) };
        if magic != crate::PORTAL_MAGIC {
            return Err(ShmError::Protocol(format!(
                "region {} is not an initialized portal segment",
                self.name
            )));
        }
        let version = unsafe { ptr::read(addr_of!((*header).version)) };
        if version != crate::PORTAL_VERSION {
            return Err(ShmError::Protocol(format!(
                "unsupported segment layout version: {}",
                version
            )));
        }
        let capacity = unsafe { ptr::read(addr_of!((*header).capacity)) } as usize;
        if capacity > mapped_size {
            return Err(ShmError::Protocol(format!(
                "segment header claims {} bytes but only {} are mapped",
                capacity, mapped_size
            )));
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            platform::unmap(self.ptr, self.capacity);
        }
        let _ = nix::unistd::close(self.fd);
        // Attachers release their mapping only; the region persists until the
        // creator removes it from the OS namespace.
        if self.role.is_creator() {
            let _ = platform::remove_region(&self.name);
            debug!(segment = %self.name, "removed shared memory segment");
        }
    }
}

/// Segment allocation statistics
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub name: String,
    pub capacity: usize,
    pub used: usize,
    pub objects: usize,
}

/// Compare an entry's stored name against a candidate.
///
/// Safety: the entry must be published (ready observed nonzero) or written by
/// the calling thread.
unsafe fn entry_name_matches(entry: *const ObjectEntry, candidate: &[u8]) -> bool {
    let len = (*entry).name_len as usize;
    len == candidate.len() && (&(*entry).name)[..len] == *candidate
}

fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Validate a region name for the OS shared memory namespace.
fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(ShmError::InvalidName(format!(
            "region name length {} out of range",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(ShmError::InvalidName("name contains a nul byte".to_string()));
    }
    // A single leading slash is the POSIX form; interior slashes are not.
    if name.strip_prefix('/').unwrap_or(name).contains('/') {
        return Err(ShmError::InvalidName(format!(
            "region name may not contain interior slashes: {}",
            name
        )));
    }
    Ok(())
}

fn validate_region_size(size: usize) -> Result<()> {
    if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
        return Err(ShmError::InvalidSize {
            size,
            min: MIN_SEGMENT_SIZE,
            max: MAX_SEGMENT_SIZE,
        });
    }
    Ok(())
}

fn validate_object_name(name: &str) -> Result<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_OBJECT_NAME {
        return Err(ShmError::InvalidName(format!(
            "object name length {} out of range",
            bytes.len()
        )));
    }
    Ok(bytes)
}

// Platform-specific implementation

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
    use nix::sys::stat::Mode;
    use std::ffi::CString;
    use std::num::NonZeroUsize;
    use std::os::unix::io::RawFd;

    pub fn create_region(name: &str, size: usize) -> Result<(NonNull<u8>, RawFd)> {
        let c_name = shm_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::from_errno(e, name))?;

        if let Err(e) = nix::unistd::ftruncate(fd, size as libc::off_t) {
            let _ = nix::unistd::close(fd);
            let _ = shm_unlink(c_name.as_c_str());
            return Err(ShmError::from_errno(e, name));
        }

        match map(fd, size) {
            Ok(ptr) => Ok((ptr, fd)),
            Err(e) => {
                let _ = nix::unistd::close(fd);
                let _ = shm_unlink(c_name.as_c_str());
                Err(e)
            }
        }
    }

    pub fn open_region(name: &str) -> Result<(NonNull<u8>, usize, RawFd)> {
        let c_name = shm_name(name)?;

        let fd = shm_open(c_name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ShmError::from_errno(e, name))?;

        let stat = match nix::sys::stat::fstat(fd) {
            Ok(stat) => stat,
            Err(e) => {
                let _ = nix::unistd::close(fd);
                return Err(ShmError::from_errno(e, name));
            }
        };
        let size = stat.st_size as usize;

        match map(fd, size) {
            Ok(ptr) => Ok((ptr, size, fd)),
            Err(e) => {
                let _ = nix::unistd::close(fd);
                Err(e)
            }
        }
    }

    pub fn remove_region(name: &str) -> Result<()> {
        let c_name = shm_name(name)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| ShmError::from_errno(e, name))
    }

    pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
        let _ = munmap(ptr.as_ptr() as *mut std::ffi::c_void, size);
    }

    fn map(fd: RawFd, size: usize) -> Result<NonNull<u8>> {
        let length = NonZeroUsize::new(size).ok_or(ShmError::InvalidSize {
            size,
            min: MIN_SEGMENT_SIZE,
            max: MAX_SEGMENT_SIZE,
        })?;

        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| ShmError::MappingFailed(e.to_string()))?;

        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ShmError::MappingFailed("mmap returned null".to_string()))
    }

    /// POSIX wants exactly one leading slash in the object name.
    fn shm_name(name: &str) -> Result<CString> {
        let normalized = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        };
        CString::new(normalized).map_err(|_| ShmError::InvalidName(name.to_string()))
    }
}
