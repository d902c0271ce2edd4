//! Shared memory portal error types

use thiserror::Error;

/// Shared memory portal error types
#[derive(Error, Debug)]
pub enum ShmError {
    /// Region not found (attacher started before the creator)
    #[error("shared memory region not found: {0}")]
    RegionNotFound(String),

    /// Region already exists (stale region from a previous run)
    #[error("shared memory region already exists: {0}")]
    RegionExists(String),

    /// Named object not found in the segment
    #[error("named object not found in segment: {0}")]
    ObjectNotFound(String),

    /// Named object constructed twice under the same name
    #[error("named object already constructed: {0}")]
    ObjectExists(String),

    /// Stored object size disagrees with the requested type
    #[error("object {name} has size {found}, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// Object table has no free entries left
    #[error("segment object table is full ({0} entries)")]
    ObjectTableFull(usize),

    /// Not enough space left in the segment
    #[error("segment exhausted: requested {requested} bytes, {remaining} remaining")]
    SegmentExhausted { requested: usize, remaining: usize },

    /// Vector resized past the capacity reserved at construction
    #[error("vector resize to {requested} exceeds reserved capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// Operation called from the wrong side of the channel
    #[error("operation requires the {0} side")]
    Role(&'static str),

    /// Invalid region or object name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Invalid region size
    #[error("invalid region size: {size}, must be between {min} and {max}")]
    InvalidSize { size: usize, min: usize, max: usize },

    /// Memory mapping failed
    #[error("memory mapping failed: {0}")]
    MappingFailed(String),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Protocol error (bad magic, incompatible layout version)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Platform-specific error
    #[error("platform error: {0}")]
    Platform(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ShmError>;

impl ShmError {
    /// Check if the error is recoverable.
    ///
    /// Almost nothing here is: every failure mode is either fixed by correct
    /// process start-up ordering and configuration, or is fatal. Nothing is
    /// retried automatically.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ShmError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(unix)]
impl ShmError {
    /// Convert platform error codes to ShmError
    pub(crate) fn from_errno(errno: nix::errno::Errno, name: &str) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::ENOENT => ShmError::RegionNotFound(name.to_string()),
            Errno::EEXIST => ShmError::RegionExists(name.to_string()),
            Errno::EACCES => ShmError::PermissionDenied(name.to_string()),
            other => ShmError::Platform(format!("{}: {}", name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery() {
        let not_found = ShmError::RegionNotFound("seg".to_string());
        assert!(!not_found.is_recoverable());

        let exists = ShmError::RegionExists("seg".to_string());
        assert!(!exists.is_recoverable());

        let interrupted = ShmError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(interrupted.is_recoverable());
    }

    #[test]
    fn test_errno_mapping() {
        use nix::errno::Errno;

        assert!(matches!(
            ShmError::from_errno(Errno::ENOENT, "seg"),
            ShmError::RegionNotFound(_)
        ));
        assert!(matches!(
            ShmError::from_errno(Errno::EEXIST, "seg"),
            ShmError::RegionExists(_)
        ));
        assert!(matches!(
            ShmError::from_errno(Errno::EACCES, "seg"),
            ShmError::PermissionDenied(_)
        ));
        assert!(matches!(
            ShmError::from_errno(Errno::EINVAL, "seg"),
            ShmError::Platform(_)
        ));
    }
}
