//! Filesystem capability
//!
//! Every path handed to a [`FileSystem`] is *logical*: an absolute path as the
//! restore sees it (`/etc/pve/storage.cfg`). The system implementation uses it
//! verbatim, a sandboxed implementation rewrites it under a fake root so tests
//! can run the full restore logic against a temp directory.

use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Uniform view of the filesystem used by every restore component.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// True when this is the live system filesystem (no sandbox root).
    fn is_system(&self) -> bool;

    /// Map a logical path to the on-disk path.
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Map an on-disk path back to its logical form.
    fn logical(&self, real: &Path) -> PathBuf;

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(self.resolve(path))
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(self.resolve(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.symlink_metadata(path).is_ok()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(self.resolve(path))
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(self.resolve(path))
    }

    /// Create (or truncate) a file opened for writing with an explicit mode.
    fn create(&self, path: &Path, mode: u32) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.resolve(path))
    }

    /// Write a whole file; the mode is enforced even if the file existed.
    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut file = self.create(path, mode)?;
        file.write_all(data)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        let real = self.resolve(path);
        fs::create_dir(&real)?;
        fs::set_permissions(&real, fs::Permissions::from_mode(mode))
    }

    /// Create a uniquely named file inside `dir`; returns it with its logical path.
    fn create_temp_file(&self, dir: &Path, prefix: &str) -> io::Result<(File, PathBuf)> {
        for attempt in 0..64u32 {
            let name = format!("{}{}", prefix, unique_suffix(attempt));
            let logical = dir.join(name);
            match OpenOptions::new()
                .write(true)
                .read(true)
                .create_new(true)
                .mode(0o600)
                .open(self.resolve(&logical))
            {
                Ok(file) => return Ok((file, logical)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("could not create a unique temp file in {}", dir.display()),
        ))
    }

    /// Create a uniquely named directory inside `dir` (mode 0700).
    fn create_temp_dir(&self, dir: &Path, prefix: &str) -> io::Result<PathBuf> {
        self.create_dir_all(dir)?;
        for attempt in 0..64u32 {
            let logical = dir.join(format!("{}{}", prefix, unique_suffix(attempt)));
            match self.create_dir(&logical, 0o700) {
                Ok(()) => return Ok(logical),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("could not create a unique temp dir in {}", dir.display()),
        ))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.resolve(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(self.resolve(path))
    }

    /// Logical paths of the directory's children, sorted by name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            names.push(entry?.file_name());
        }
        names.sort();
        Ok(names.into_iter().map(|n| path.join(n)).collect())
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(self.resolve(original), self.resolve(link))
    }

    /// Create a symlink at `link`; the target is stored verbatim.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.resolve(path))
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::chown(self.resolve(path), Some(uid), Some(gid))
    }
}

/// Filesystem backed by `std::fs`, optionally rooted under a sandbox directory.
#[derive(Clone)]
pub struct OsFs {
    root: Option<PathBuf>,
}

impl OsFs {
    /// The live system filesystem.
    pub fn system() -> Self {
        Self { root: None }
    }

    /// A filesystem whose logical `/` is `root`.
    pub fn sandboxed(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

impl fmt::Debug for OsFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            None => write!(f, "OsFs(system)"),
            Some(root) => write!(f, "OsFs(sandbox: {})", root.display()),
        }
    }
}

impl FileSystem for OsFs {
    fn is_system(&self) -> bool {
        self.root.is_none()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            None => path.to_path_buf(),
            Some(root) => {
                let mut out = root.clone();
                for component in path.components() {
                    match component {
                        Component::Normal(part) => out.push(part),
                        Component::ParentDir => {
                            if out != *root {
                                out.pop();
                            }
                        }
                        Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                    }
                }
                out
            }
        }
    }

    fn logical(&self, real: &Path) -> PathBuf {
        match &self.root {
            None => real.to_path_buf(),
            Some(root) => match real.strip_prefix(root) {
                Ok(rel) => Path::new("/").join(rel),
                Err(_) => real.to_path_buf(),
            },
        }
    }
}

fn unique_suffix(attempt: u32) -> String {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    format!("{:x}{:04x}{:02x}", std::process::id(), nanos & 0xffff, attempt)
}

/// Join a possibly absolute logical path under `root` (`/etc/x` under `/stage` → `/stage/etc/x`).
pub fn join_under(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sandbox_resolves_under_root() {
        let fs = OsFs::sandboxed("/sandbox");
        assert_eq!(
            fs.resolve(Path::new("/etc/pve/storage.cfg")),
            PathBuf::from("/sandbox/etc/pve/storage.cfg")
        );
        assert_eq!(
            fs.resolve(Path::new("/../../etc")),
            PathBuf::from("/sandbox/etc")
        );
        assert!(!fs.is_system());
        assert!(OsFs::system().is_system());
    }

    #[test]
    fn test_logical_round_trip() {
        let fs = OsFs::sandboxed("/sandbox");
        let real = fs.resolve(Path::new("/tmp/x"));
        assert_eq!(fs.logical(&real), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_write_enforces_mode() {
        let dir = TempDir::new().unwrap();
        let fs = OsFs::sandboxed(dir.path());
        fs.create_dir_all(Path::new("/etc")).unwrap();
        fs.write(Path::new("/etc/a"), b"one", 0o644).unwrap();
        fs.write(Path::new("/etc/a"), b"two", 0o600).unwrap();

        let meta = fs.metadata(Path::new("/etc/a")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
        assert_eq!(fs.read(Path::new("/etc/a")).unwrap(), b"two");
    }

    #[test]
    fn test_temp_dir_and_file_are_unique() {
        let dir = TempDir::new().unwrap();
        let fs = OsFs::sandboxed(dir.path());
        let a = fs.create_temp_dir(Path::new("/tmp/tool"), "x-").unwrap();
        let b = fs.create_temp_dir(Path::new("/tmp/tool"), "x-").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/tool"));

        let (_f, path) = fs.create_temp_file(&a, "f-").unwrap();
        assert!(fs.exists(&path));
    }

    #[test]
    fn test_read_dir_returns_sorted_logical_paths() {
        let dir = TempDir::new().unwrap();
        let fs = OsFs::sandboxed(dir.path());
        fs.create_dir_all(Path::new("/d")).unwrap();
        fs.write(Path::new("/d/b"), b"", 0o644).unwrap();
        fs.write(Path::new("/d/a"), b"", 0o644).unwrap();

        let entries = fs.read_dir(Path::new("/d")).unwrap();
        assert_eq!(entries, vec![PathBuf::from("/d/a"), PathBuf::from("/d/b")]);
    }

    #[test]
    fn test_join_under() {
        assert_eq!(
            join_under(Path::new("/stage"), Path::new("/etc/hosts")),
            PathBuf::from("/stage/etc/hosts")
        );
        assert_eq!(
            join_under(Path::new("/stage"), Path::new("./etc/auto.*")),
            PathBuf::from("/stage/etc/auto.*")
        );
    }
}
