//! Disk space and file descriptor checks run before the node opens its
//! databases.

use crate::error::StartupError;
use std::path::Path;

/// Free space required on the filesystem of the data directory, 50 MiB.
pub const DEFAULT_MIN_FREE_DISK_SPACE: u64 = 50 * 1024 * 1024;

/// File descriptors needed by the block files and the two databases.
pub const DEFAULT_MIN_FILE_DESCRIPTORS: u64 = 150;

/// Resource the node can not start without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    DiskSpace,
    FileDescriptors,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DiskSpace => write!(f, "disk space (bytes)"),
            Self::FileDescriptors => write!(f, "file descriptors"),
        }
    }
}

/// Fails unless the data directory has `min_free_disk_space` bytes available
/// and the process may open `min_file_descriptors` files.
///
/// The soft descriptor limit is raised towards the hard limit when it is too
/// low. Platforms without these notions pass unchecked.
pub(crate) fn check_resources(
    data_dir: &Path,
    min_free_disk_space: u64,
    min_file_descriptors: u64,
) -> Result<(), StartupError> {
    let io_error = |err| StartupError::DataDir {
        path: data_dir.to_path_buf(),
        err,
    };

    if let Some(available) = sys::available_disk_space(data_dir).map_err(io_error)? {
        if available < min_free_disk_space {
            return Err(StartupError::InsufficientResources {
                resource: Resource::DiskSpace,
                available,
                required: min_free_disk_space,
            });
        }
        tracing::debug!(available, "Free disk space in data directory");
    }

    if let Some(available) = sys::raise_file_descriptor_limit(min_file_descriptors) {
        if available < min_file_descriptors {
            return Err(StartupError::InsufficientResources {
                resource: Resource::FileDescriptors,
                available,
                required: min_file_descriptors,
            });
        }
        tracing::debug!(available, "File descriptor limit");
    }

    Ok(())
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    #[allow(clippy::unnecessary_cast)]
    pub(super) fn available_disk_space(path: &Path) -> io::Result<Option<u64>> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: `path` is nul terminated and `stat` is only read once
        // statvfs reported success.
        let stat = unsafe {
            if libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            stat.assume_init()
        };
        Ok(Some((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)))
    }

    /// Returns the soft limit on open files after trying to lift it to `wanted`.
    #[allow(clippy::unnecessary_cast)]
    pub(super) fn raise_file_descriptor_limit(wanted: u64) -> Option<u64> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid rlimit to write into.
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
            return None;
        }

        let current = limit.rlim_cur as u64;
        if current >= wanted {
            return Some(current);
        }

        let raised = libc::rlimit {
            rlim_cur: wanted.min(limit.rlim_max as u64) as libc::rlim_t,
            rlim_max: limit.rlim_max,
        };
        // SAFETY: `raised` keeps the hard limit and only moves the soft one.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
            tracing::debug!(current, wanted, "Failed to raise the file descriptor limit");
            return Some(current);
        }

        Some(raised.rlim_cur as u64)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::path::Path;

    pub(super) fn available_disk_space(_path: &Path) -> io::Result<Option<u64>> {
        Ok(None)
    }

    pub(super) fn raise_file_descriptor_limit(_wanted: u64) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modest_requirements_are_met() {
        let tmp = tempfile::tempdir().unwrap();
        check_resources(tmp.path(), 1, 16).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unsatisfiable_requirements_are_fatal() {
        let tmp = tempfile::tempdir().unwrap();

        match check_resources(tmp.path(), u64::MAX, 16) {
            Err(StartupError::InsufficientResources {
                resource: Resource::DiskSpace,
                required,
                ..
            }) => assert_eq!(required, u64::MAX),
            other => panic!("Unexpected result: {other:?}"),
        }

        match check_resources(tmp.path(), 1, u64::MAX) {
            Err(StartupError::InsufficientResources {
                resource: Resource::FileDescriptors,
                available,
                ..
            }) => assert!(available < u64::MAX),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_data_dir_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing");
        assert!(matches!(
            check_resources(&missing, 1, 16),
            Err(StartupError::DataDir { .. })
        ));
    }
}
