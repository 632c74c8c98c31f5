//! Filesystem collaborator executing the passthrough verbs.

use std::fmt;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use libc::{EACCES, EINVAL, EIO};

/// Failure of a filesystem operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    pub errno: i32,
    pub text: String,
}

impl FsError {
    pub fn new(errno: i32, text: impl ToString) -> Self {
        FsError {
            errno,
            text: text.to_string(),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (errno {})", self.text, self.errno)
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::new(e.raw_os_error().unwrap_or(EIO), e)
    }
}

/// Free space summary returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceInfo {
    pub free_mb: u64,
    /// Used space in percent.
    pub util: u32,
}

/// Operations a leaf server performs on behalf of the cluster.
pub trait FileSystem: Send + Sync {
    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError>;

    fn mkdir(&self, path: &str, mode: u32, recursive: bool)
        -> Result<(), FsError>;

    fn rename(&self, old: &str, new: &str) -> Result<(), FsError>;

    fn unlink(&self, path: &str) -> Result<(), FsError>;

    fn rmdir(&self, path: &str) -> Result<(), FsError>;

    fn truncate(&self, path: &str, size: u64) -> Result<(), FsError>;

    /// Does the file exist locally?
    fn exists(&self, path: &str) -> Result<bool, FsError>;

    fn statfs(&self) -> Result<SpaceInfo, FsError>;
}

/// `FileSystem` over a local directory tree.
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFs { root: root.into() }
    }

    // Maps a cluster path under the root, refusing escapes via "..".
    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut full = self.root.clone();
        for comp in Path::new(path).components() {
            match comp {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(seg) => full.push(seg),
                _ => {
                    return Err(FsError::new(
                        EINVAL,
                        format!("invalid path '{}'", path),
                    ))
                }
            }
        }
        if full == self.root {
            return Err(FsError::new(
                EACCES,
                format!("refusing to operate on root via '{}'", path),
            ));
        }
        Ok(full)
    }
}

impl FileSystem for LocalFs {
    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        fs::set_permissions(
            self.resolve(path)?,
            Permissions::from_mode(mode & 0o7777),
        )?;
        Ok(())
    }

    fn mkdir(
        &self,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), FsError> {
        DirBuilder::new()
            .recursive(recursive)
            .mode(mode & 0o7777)
            .create(self.resolve(path)?)?;
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        fs::rename(self.resolve(old)?, self.resolve(new)?)?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        fs::remove_dir(self.resolve(path)?)?;
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        OpenOptions::new()
            .write(true)
            .open(self.resolve(path)?)?
            .set_len(size)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        match fs::metadata(self.resolve(path)?) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn statfs(&self) -> Result<SpaceInfo, FsError> {
        let free = fs2::available_space(&self.root)?;
        let total = fs2::total_space(&self.root)?;
        let util = if total == 0 {
            0
        } else {
            (100 - free.saturating_mul(100) / total) as u32
        };
        Ok(SpaceInfo {
            free_mb: free >> 20,
            util,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process;
    use libc::ENOENT;

    fn scratch(name: &str) -> Result<PathBuf, FsError> {
        let dir = env::temp_dir()
            .join(format!("fedloc-fsys-{}-{}", name, process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn resolve_rejects_escapes() -> Result<(), FsError> {
        let lfs = LocalFs::new("/srv/data");
        assert_eq!(lfs.resolve("/a/./b")?, PathBuf::from("/srv/data/a/b"));
        assert_eq!(lfs.resolve("/a/../../etc").unwrap_err().errno, EINVAL);
        assert_eq!(lfs.resolve("/").unwrap_err().errno, EACCES);
        Ok(())
    }

    #[test]
    fn local_ops() -> Result<(), FsError> {
        let root = scratch("ops")?;
        let lfs = LocalFs::new(&root);
        lfs.mkdir("/d/e", 0o755, true)?;
        assert!(lfs.mkdir("/x/y", 0o755, false).is_err());
        fs::write(root.join("d/e/f"), b"0123456789")?;
        assert!(lfs.exists("/d/e/f")?);
        assert!(!lfs.exists("/d/e")?);
        lfs.truncate("/d/e/f", 4)?;
        assert_eq!(fs::metadata(root.join("d/e/f"))?.len(), 4);
        lfs.chmod("/d/e/f", 0o600)?;
        lfs.rename("/d/e/f", "/d/g")?;
        assert!(!lfs.exists("/d/e/f")?);
        lfs.unlink("/d/g")?;
        assert_eq!(lfs.unlink("/d/g").unwrap_err().errno, ENOENT);
        lfs.rmdir("/d/e")?;
        assert!(lfs.statfs()?.util <= 100);
        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
