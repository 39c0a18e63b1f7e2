//! Batch-scoped named-pipe storage.
//!
//! Every FIFO of a batch lives in one private temporary directory. The directory
//! (and with it every FIFO) is removed by [`FifoDir::close`] or, on any other exit
//! path, when the value is dropped.
use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, trace};

use crate::config::ExecConfig;

pub struct FifoDir {
    dir: TempDir,
    seq: usize,
    fifos: Vec<PathBuf>,
}

impl FifoDir {
    /// Create the private directory under `cfg.fifo_dir` (or the system temp dir).
    pub fn create(cfg: &ExecConfig) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&cfg.fifo_prefix);
        let dir = match &cfg.fifo_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(target: "plumb.exec.fifo", dir = %dir.path().display(), "fifo directory created");
        Ok(Self {
            dir,
            seq: 0,
            fifos: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// FIFOs created so far, in allocation order.
    pub fn fifos(&self) -> &[PathBuf] {
        &self.fifos
    }

    /// Create a fresh FIFO for one end of `conduit`.
    pub fn allocate(&mut self, conduit: &str, role: &str) -> io::Result<PathBuf> {
        let file = format!("{:03}-{}.{}", self.seq, sanitize(conduit), role);
        let path = self.dir.path().join(file);
        self.seq += 1;

        mkfifo(&path)?;
        trace!(target: "plumb.exec.fifo", conduit, role, path = %path.display(), "fifo created");
        self.fifos.push(path.clone());
        Ok(path)
    }

    /// Remove the directory and every FIFO in it.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(target: "plumb.exec.fifo", dir = %path.display(), "fifo directory removed");
        Ok(())
    }
}

impl std::fmt::Debug for FifoDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoDir")
            .field("path", &self.dir.path())
            .field("fifos", &self.fifos.len())
            .finish()
    }
}

/// Wake peers blocked in `open(2)` on a single FIFO.
///
/// The FIFO is opened read-write without blocking and closed again, which
/// satisfies a waiting peer on either side and leaves a reader that never saw
/// a writer at end of stream.
pub fn release(path: &Path) {
    if let Err(e) = open_nonblocking_rw(path) {
        trace!(target: "plumb.exec.fifo", path = %path.display(), error = %e, "release skipped");
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "conduit".to_string()
    } else {
        cleaned
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn mkfifo(path: &Path) -> io::Result<()> {
            use std::{ffi::CString, os::unix::ffi::OsStrExt};

            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
            if rc != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }

        fn open_nonblocking_rw(path: &Path) -> io::Result<()> {
            use std::os::unix::fs::OpenOptionsExt;

            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .map(drop)
        }
    } else {
        fn mkfifo(_path: &Path) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "named pipes require a unix platform",
            ))
        }

        fn open_nonblocking_rw(_path: &Path) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{os::unix::fs::FileTypeExt, thread, time::Duration};

    fn scratch() -> (tempfile::TempDir, ExecConfig) {
        let parent = tempfile::tempdir().unwrap();
        let cfg = ExecConfig::default()
            .with_fifo_dir(parent.path())
            .with_fifo_prefix("fifo-test-");
        (parent, cfg)
    }

    #[test]
    fn allocate_creates_unique_fifos() {
        let (_parent, cfg) = scratch();
        let mut dir = FifoDir::create(&cfg).unwrap();

        let a = dir.allocate("data", "out").unwrap();
        let b = dir.allocate("data", "in").unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
        assert!(std::fs::metadata(&a).unwrap().file_type().is_fifo());
        assert!(std::fs::metadata(&b).unwrap().file_type().is_fifo());
        assert_eq!(dir.fifos(), &[a, b]);
    }

    #[test]
    fn directory_uses_prefix() {
        let (_parent, cfg) = scratch();
        let dir = FifoDir::create(&cfg).unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("fifo-test-"));
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize("a/b c"), "a_b_c");
        assert_eq!(sanitize(""), "conduit");
        assert_eq!(sanitize("ok-name_1"), "ok-name_1");
    }

    #[test]
    fn close_removes_everything() {
        let (parent, cfg) = scratch();
        let mut dir = FifoDir::create(&cfg).unwrap();
        dir.allocate("x", "out").unwrap();
        dir.close().unwrap();

        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn drop_removes_everything() {
        let (parent, cfg) = scratch();
        {
            let mut dir = FifoDir::create(&cfg).unwrap();
            dir.allocate("x", "out").unwrap();
            dir.allocate("x", "in").unwrap();
        }
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_unblocks_pending_open() {
        let (_parent, cfg) = scratch();
        let mut dir = FifoDir::create(&cfg).unwrap();
        let path = dir.allocate("orphan", "in").unwrap();

        let waiting = path.clone();
        let opener = thread::spawn(move || std::fs::File::open(&waiting).map(drop));
        for _ in 0..500 {
            if opener.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
            release(&path);
        }

        assert!(opener.is_finished(), "open(2) stayed blocked");
        opener.join().unwrap().unwrap();
    }
}
