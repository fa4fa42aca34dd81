use std::path::Path;

use crate::errors::Result;

/// Access to the small slice of filesystem state the permissions
/// engine owns: one extended attribute and the mode bits of a share
/// root directory. Keeping this behind a trait lets the engine run
/// against an in-memory store in tests.
pub trait ShareRootBackend {
    /// Read the named xattr. `None` when the attribute is absent.
    fn get_marker(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write the named xattr, durably.
    fn set_marker(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;

    /// Set the permission bits of the directory at `path`.
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
}

#[cfg(unix)]
pub use fs_backend::FsBackend;

#[cfg(unix)]
mod fs_backend {
    use std::path::Path;

    use rustix::fs::{self, Mode, OFlags, XattrFlags};
    use tracing::debug;

    use super::ShareRootBackend;
    use crate::errors::{Error, Result};

    /// Real extended-attribute and chmod backend.
    ///
    /// Mutations go through an O_DIRECTORY fd and are fsynced before
    /// returning, so a status marker is never observed ahead of the
    /// permission change it records.
    #[derive(Debug, Default)]
    pub struct FsBackend;

    impl FsBackend {
        pub fn new() -> Self {
            Self
        }

        fn open_dir(path: &Path) -> Result<rustix::fd::OwnedFd> {
            fs::open(
                path,
                OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
                Mode::empty(),
            )
            .map_err(|err| backend_error(path, err))
        }
    }

    fn backend_error(path: &Path, err: rustix::io::Errno) -> Error {
        Error::PermissionBackend {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    impl ShareRootBackend for FsBackend {
        fn get_marker(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
            debug!("reading xattr {:?}: {:?}", name, path);
            // first call sizes the attribute, second fetches it
            let size = match fs::lgetxattr(path, name, &mut [0u8; 0][..]) {
                Ok(size) => size,
                Err(rustix::io::Errno::NODATA) => return Ok(None),
                Err(err) => return Err(backend_error(path, err)),
            };
            let mut buf = vec![0u8; size];
            match fs::lgetxattr(path, name, &mut buf[..]) {
                Ok(len) => {
                    buf.truncate(len);
                    Ok(Some(buf))
                }
                Err(rustix::io::Errno::NODATA) => Ok(None),
                Err(err) => Err(backend_error(path, err)),
            }
        }

        fn set_marker(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
            debug!("setting xattr {:?}: {:?}", name, path);
            let dfd = Self::open_dir(path)?;
            fs::fsetxattr(&dfd, name, value, XattrFlags::empty())
                .map_err(|err| backend_error(path, err))?;
            fs::fsync(&dfd).map_err(|err| backend_error(path, err))
        }

        fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
            debug!("chmod {:o}: {:?}", mode, path);
            let dfd = Self::open_dir(path)?;
            fs::fchmod(&dfd, Mode::from_raw_mode(mode))
                .map_err(|err| backend_error(path, err))?;
            fs::fsync(&dfd).map_err(|err| backend_error(path, err))
        }
    }
}

pub use memory::MemoryBackend;

mod memory {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::ShareRootBackend;
    use crate::errors::{Error, Result};

    /// In-memory stand-in for `FsBackend`, recording every mode change
    /// so tests can assert on apply counts.
    #[derive(Debug, Default)]
    pub struct MemoryBackend {
        xattrs: Mutex<HashMap<(PathBuf, String), Vec<u8>>>,
        mode_changes: Mutex<Vec<(PathBuf, u32)>>,
        fail: Mutex<bool>,
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent backend call fail, as an unsupported
        /// filesystem would.
        pub fn set_failing(&self, failing: bool) {
            *self.fail.lock().unwrap() = failing;
        }

        pub fn mode_changes(&self) -> Vec<(PathBuf, u32)> {
            self.mode_changes.lock().unwrap().clone()
        }

        pub fn current_mode(&self, path: &Path) -> Option<u32> {
            self.mode_changes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(p, _)| p == path)
                .map(|(_, mode)| *mode)
        }

        fn check_failing(&self, path: &Path) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(Error::PermissionBackend {
                    path: path.to_path_buf(),
                    reason: "backend unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    impl ShareRootBackend for MemoryBackend {
        fn get_marker(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
            self.check_failing(path)?;
            let xattrs = self.xattrs.lock().unwrap();
            Ok(xattrs.get(&(path.to_path_buf(), name.to_string())).cloned())
        }

        fn set_marker(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
            self.check_failing(path)?;
            let mut xattrs = self.xattrs.lock().unwrap();
            xattrs.insert((path.to_path_buf(), name.to_string()), value.to_vec());
            Ok(())
        }

        fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
            self.check_failing(path)?;
            self.mode_changes
                .lock()
                .unwrap()
                .push((path.to_path_buf(), mode));
            Ok(())
        }
    }
}
