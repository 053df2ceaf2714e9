//! Cooperative stop flag shared by the supervisor and every worker.
//!
//! The flag only ever moves from "running" to "stopped". There is no reset.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Uniform set/check interface over the different flag backings, so worker
/// loops do not care whether they run in a forked process or a thread.
pub trait StopSignal: Send + Sync {
    /// Request a stop. Idempotent.
    fn set(&self);

    /// Non-blocking observation of the flag.
    fn is_set(&self) -> bool;
}

/// Flag stored in an anonymous `MAP_SHARED` mapping.
///
/// The mapping is inherited across `fork`, so forked load workers and the
/// supervisor's own threads all observe the same byte.
pub struct SharedFlag {
    flag: NonNull<AtomicBool>,
}

// The pointee is an atomic in a mapping that lives as long as `self`.
unsafe impl Send for SharedFlag {}
unsafe impl Sync for SharedFlag {}

impl SharedFlag {
    pub fn new() -> io::Result<Self> {
        let len = std::mem::size_of::<AtomicBool>();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let flag = NonNull::new(ptr.cast::<AtomicBool>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        unsafe { flag.as_ptr().write(AtomicBool::new(false)) };
        Ok(Self { flag })
    }

    fn atomic(&self) -> &AtomicBool {
        unsafe { self.flag.as_ref() }
    }
}

impl StopSignal for SharedFlag {
    fn set(&self) {
        self.atomic().store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.atomic().load(Ordering::SeqCst)
    }
}

impl Drop for SharedFlag {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.flag.as_ptr().cast::<libc::c_void>(),
                std::mem::size_of::<AtomicBool>(),
            );
        }
    }
}

/// Flag for units that share the supervisor's address space only.
///
/// Used for the operator interrupt request, which is raised from the
/// Ctrl-C handler thread.
#[derive(Clone, Default, Debug)]
pub struct LocalFlag(Arc<AtomicBool>);

impl StopSignal for LocalFlag {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_shared_flag_starts_clear() {
        let flag = SharedFlag::new().unwrap();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_shared_flag_is_monotonic() {
        let flag = SharedFlag::new().unwrap();
        flag.set();
        assert!(flag.is_set());
        flag.set();
        for _ in 0..100 {
            assert!(flag.is_set());
        }
    }

    #[test]
    fn test_shared_flag_visible_across_threads() {
        let flag = Arc::new(SharedFlag::new().unwrap());
        let writer = Arc::clone(&flag);
        thread::spawn(move || writer.set()).join().unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn test_local_flag_clones_share_state() {
        let flag = LocalFlag::default();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
    }
}
