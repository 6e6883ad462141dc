//! IPC primitives shared by the engine, launchers, and function workers
//!
//! All IPC artifacts live under one configurable root directory (default
//! `/dev/shm/faas_ipc`):
//!
//! ```text
//! <root>/engine.sock          engine Unix-domain listener
//! <root>/shm/<name>           named shared-memory regions
//! <root>/fifo/<name>          worker FIFOs
//! ```
//!
//! Shared-memory regions are file-backed and mapped with `memmap2`. Exactly
//! one holder of a region carries the remove-on-destruction flag (the engine
//! for external inputs, the worker for its own output); every other holder
//! is a read-only view.

use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{LumenError, Result};

/// Layout of the IPC root directory
#[derive(Debug, Clone)]
pub struct IpcPaths {
    root: PathBuf,
}

impl IpcPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree. Idempotent.
    pub fn setup(&self) -> Result<()> {
        fs::create_dir_all(self.shm_dir())?;
        fs::create_dir_all(self.fifo_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn engine_socket(&self) -> PathBuf {
        self.root.join("engine.sock")
    }

    fn shm_dir(&self) -> PathBuf {
        self.root.join("shm")
    }

    fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifo")
    }

    pub fn shm_path(&self, name: &str) -> PathBuf {
        self.shm_dir().join(name)
    }

    pub fn fifo_path(&self, name: &str) -> PathBuf {
        self.fifo_dir().join(name)
    }
}

pub fn func_call_input_shm_name(full_call_id: u64) -> String {
    format!("funccall-input-{full_call_id:016x}")
}

pub fn func_call_output_shm_name(full_call_id: u64) -> String {
    format!("funccall-output-{full_call_id:016x}")
}

pub fn func_worker_input_fifo_name(client_id: u16) -> String {
    format!("funcworker-{client_id}-input")
}

pub fn func_worker_output_fifo_name(client_id: u16) -> String {
    format!("funcworker-{client_id}-output")
}

pub fn func_call_output_fifo_name(full_call_id: u64) -> String {
    format!("funccall-output-{full_call_id:016x}")
}

/// A named, file-backed shared-memory region
pub struct ShmRegion {
    path: PathBuf,
    mmap: Option<MmapMut>,
    size: usize,
    remove_on_destruction: bool,
}

impl ShmRegion {
    /// Create a new region of `size` bytes. Fails if the name is taken.
    pub fn create(path: impl Into<PathBuf>, size: usize) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| LumenError::ShmError(format!("create {}: {e}", path.display())))?;
        file.set_len(size as u64)
            .map_err(|e| LumenError::ShmError(format!("truncate {}: {e}", path.display())))?;
        let mmap = if size > 0 {
            // The mapping stays valid for the life of this struct; nothing
            // else truncates the backing file.
            Some(unsafe {
                MmapMut::map_mut(&file)
                    .map_err(|e| LumenError::ShmError(format!("mmap {}: {e}", path.display())))?
            })
        } else {
            None
        };
        Ok(Self {
            path,
            mmap,
            size,
            remove_on_destruction: false,
        })
    }

    /// Open an existing region, sized by the backing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LumenError::ShmError(format!("open {}: {e}", path.display())))?;
        let size = file
            .metadata()
            .map_err(|e| LumenError::ShmError(format!("stat {}: {e}", path.display())))?
            .len() as usize;
        let mmap = if size > 0 {
            Some(unsafe {
                MmapMut::map_mut(&file)
                    .map_err(|e| LumenError::ShmError(format!("mmap {}: {e}", path.display())))?
            })
        } else {
            None
        };
        Ok(Self {
            path,
            mmap,
            size,
            remove_on_destruction: false,
        })
    }

    /// Make this holder the one that unlinks the region on drop
    pub fn enable_remove_on_destruction(&mut self) {
        self.remove_on_destruction = true;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.mmap.as_deref_mut() {
            Some(slice) => slice,
            None => &mut [],
        }
    }

    /// Copy `data` into the region starting at offset 0
    pub fn write_all(&mut self, data: &[u8]) {
        assert!(data.len() <= self.size, "write beyond shm region");
        if !data.is_empty() {
            self.as_mut_slice()[..data.len()].copy_from_slice(data);
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        self.mmap.take();
        if self.remove_on_destruction {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to unlink shm region");
            }
        }
    }
}

/// Create a FIFO special file. Fails if the name is taken.
pub fn create_fifo(path: &Path) -> Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| LumenError::FifoError(format!("mkfifo {}: {e}", path.display())))
}

/// Open a FIFO for read+write without blocking on the peer.
///
/// Opening read+write keeps the FIFO from seeing EOF when the peer closes
/// between calls.
pub fn open_fifo_read_write_nonblocking(path: &Path) -> Result<fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| LumenError::FifoError(format!("open {}: {e}", path.display())))
}

pub fn remove_fifo(path: &Path) -> Result<()> {
    fs::remove_file(path)
        .map_err(|e| LumenError::FifoError(format!("unlink {}: {e}", path.display())))
}
