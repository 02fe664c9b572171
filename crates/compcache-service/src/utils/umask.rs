/// Applies a process umask for as long as the guard is alive.
///
/// The umask is process-wide state, so callers should hold at most one guard at a time.
#[derive(Debug)]
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    pub fn set(mask: u32) -> Self {
        // SAFETY: `umask` cannot fail and only swaps an integer in the process state.
        let previous = unsafe { libc::umask(mask as libc::mode_t) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: see `UmaskGuard::set`.
        unsafe {
            libc::umask(self.previous);
        }
    }
}
