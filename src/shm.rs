//! Shared-memory pool.
//!
//! Allocates page-aligned buffers backed by named POSIX shared-memory
//! objects and registers each with the driver via `shm_map`. If the
//! driver reports shared memory as unsupported — distinguishable from a
//! transient failure via [`crate::driver::ShmMapOutcome`] — the pool
//! latches permanently `invalid` and every subsequent `allocate` returns
//! `None`, so callers fall back to the inline RPC transport.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use parking_lot::Mutex;

use crate::driver::{DriverClient, ShmMapOutcome, ShmProt};
use crate::error::{Error, Result};

/// Page-aligned buffer backed by a named shared-memory object, registered
/// with the driver. Owned exclusively by whichever [`SharedMemoryPool`]
/// minted it; descriptors hold only the mapping id, never the pointer,
/// so the pool's free-list is the sole owner.
pub struct SharedMemoryBuffer {
    size: usize,
    ptr: std::ptr::NonNull<u8>,
    path: String,
    mapping_id: u64,
}

// Safety: a buffer is handed to at most one live runtime I/O descriptor
// at a time; the pool's mutex serialises every allocate/free that could
// otherwise race on the same mapping.
unsafe impl Send for SharedMemoryBuffer {}
unsafe impl Sync for SharedMemoryBuffer {}

impl SharedMemoryBuffer {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mapping_id(&self) -> u64 {
        self.mapping_id
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for SharedMemoryBuffer {
    fn drop(&mut self) {
        if let Some(len) = NonZeroUsize::new(self.size) {
            let _ = unsafe { munmap(self.ptr.cast(), len.get()) };
        }
        let _ = shm_unlink(self.path.as_str());
    }
}

enum MintFailure {
    Unsupported,
    Other(Error),
}

struct Inner {
    free_list: HashMap<usize, Vec<SharedMemoryBuffer>>,
    invalid: bool,
}

/// Process-local pool of shared-memory buffers for one device's driver
/// session. A single mutex protects the free-list and the invalid flag
/// together; the flag is re-checked inside the lock on every allocation
/// to drain the race between observing `invalid` and acquiring the lock.
pub struct SharedMemoryPool {
    driver: Arc<DriverClient>,
    session: u64,
    inner: Mutex<Inner>,
}

impl SharedMemoryPool {
    /// `enabled = false` (from `SHM_MAP=no`) latches the pool invalid at
    /// construction, so every caller takes the inline-transport path
    /// without ever attempting a `shm_open`.
    pub fn new(driver: Arc<DriverClient>, session: u64, enabled: bool) -> Self {
        Self {
            driver,
            session,
            inner: Mutex::new(Inner { free_list: HashMap::new(), invalid: !enabled }),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.lock().invalid
    }

    /// Consult the size-indexed free-list first; otherwise mint a fresh
    /// buffer. Returns `None` once the pool has latched `invalid`, either
    /// from construction or from a prior driver-reported
    /// shared-memory-unsupported response.
    pub fn allocate(&self, size: usize) -> Option<SharedMemoryBuffer> {
        let mut inner = self.inner.lock();
        if inner.invalid {
            return None;
        }
        if let Some(list) = inner.free_list.get_mut(&size) {
            if let Some(buf) = list.pop() {
                return Some(buf);
            }
        }
        match self.mint(size) {
            Ok(buf) => Some(buf),
            Err(MintFailure::Unsupported) => {
                tracing::warn!(size, "driver reports shared memory unsupported; pool now invalid");
                inner.invalid = true;
                None
            }
            Err(MintFailure::Other(e)) => {
                tracing::warn!(error = %e, size, "shared-memory allocation failed, falling back to inline transport");
                None
            }
        }
    }

    fn mint(&self, size: usize) -> std::result::Result<SharedMemoryBuffer, MintFailure> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| MintFailure::Other(Error::InvalidArgument("zero-sized allocation".into())))?;

        let name = format!("/neuron_clib_{}", uuid::Uuid::new_v4());
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| MintFailure::Other(Error::ResourceExhausted(format!("shm_open {}: {}", name, e))))?;

        if let Err(e) = ftruncate(&fd, size as libc_off_t) {
            let _ = shm_unlink(name.as_str());
            return Err(MintFailure::Other(Error::Internal(format!("ftruncate {}: {}", name, e))));
        }

        let ptr = unsafe {
            mmap(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, &fd, 0)
        }
        .map_err(|e| {
            let _ = shm_unlink(name.as_str());
            MintFailure::Other(Error::Internal(format!("mmap {}: {}", name, e)))
        })?;

        match self.driver.shm_map_checked(&name, ShmProt::ReadWrite, self.session) {
            Ok(ShmMapOutcome::Mapped(mapping_id)) => {
                Ok(SharedMemoryBuffer { size, ptr: ptr.cast(), path: name, mapping_id })
            }
            Ok(ShmMapOutcome::Unsupported) => {
                unsafe {
                    let _ = munmap(ptr, size);
                }
                let _ = shm_unlink(name.as_str());
                Err(MintFailure::Unsupported)
            }
            Err(e) => {
                unsafe {
                    let _ = munmap(ptr, size);
                }
                let _ = shm_unlink(name.as_str());
                Err(MintFailure::Other(e))
            }
        }
    }

    /// Return a buffer to the size-indexed free-list for reuse.
    pub fn free(&self, buffer: SharedMemoryBuffer) {
        let mut inner = self.inner.lock();
        inner.free_list.entry(buffer.size).or_default().push(buffer);
    }

    /// Unregister every free buffer with the driver, unmap it, and drop
    /// it. Buffers currently held by a live descriptor are not in the
    /// free-list and are unaffected; they are released back to the pool
    /// by the caller before `clear` is meaningful, mirroring the
    /// invariant that while a buffer is held, the pool will not hand it
    /// to another descriptor.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, buffers) in inner.free_list.drain() {
            for buffer in buffers {
                if let Err(e) = self.driver.shm_unmap(&buffer.path, ShmProt::ReadWrite) {
                    tracing::warn!(error = %e, path = %buffer.path, "shm_unmap failed during pool clear, continuing");
                }
                // `buffer` drops here: munmap + shm_unlink.
            }
        }
    }
}

#[cfg(target_os = "linux")]
type libc_off_t = i64;
#[cfg(not(target_os = "linux"))]
type libc_off_t = nix::libc::off_t;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    /// A connected `DriverClient` whose server side never replies. Enough
    /// to exercise the `enabled = false` path, which never sends a
    /// request.
    fn idle_driver_client() -> Arc<DriverClient> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm-test.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
            std::mem::forget(dir);
        });
        Arc::new(DriverClient::initialize(&format!("unix:{}", path.display())).unwrap())
    }

    #[test]
    fn disabled_pool_is_invalid_from_construction() {
        let driver = idle_driver_client();
        let pool = SharedMemoryPool::new(driver, 0, false);
        assert!(!pool.is_valid());
        assert!(pool.allocate(4096).is_none());
    }

    /// A buffer backed by a real anonymous mapping (so `Drop`'s `munmap`
    /// is well-defined) but never registered with the driver — enough to
    /// exercise free-list identity without a `shm_open`/`shm_map` round
    /// trip.
    fn fake_buffer(size: usize, mapping_id: u64) -> SharedMemoryBuffer {
        let len = NonZeroUsize::new(size).unwrap();
        let ptr = unsafe {
            nix::sys::mman::mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .unwrap();
        SharedMemoryBuffer { size, ptr: ptr.cast(), path: "/neuron_clib_test_fake".into(), mapping_id }
    }

    #[test]
    fn free_then_allocate_returns_same_buffer_identity() {
        let driver = idle_driver_client();
        let pool = SharedMemoryPool::new(driver, 0, true);
        let original = fake_buffer(4096, 42);
        pool.free(original);
        let reused = pool.allocate(4096).expect("free-list hit should not consult the driver");
        assert_eq!(reused.mapping_id, 42);
    }

    #[test]
    fn invalid_flag_short_circuits_allocate_without_minting() {
        let driver = idle_driver_client();
        let pool = SharedMemoryPool::new(driver, 0, true);
        pool.inner.lock().invalid = true;
        assert!(pool.allocate(4096).is_none());
    }
}
