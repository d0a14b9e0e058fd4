use std::ops::Range;

/// Fixed capacity of the capture buffer.
pub(crate) const MAX_FRAMES: usize = 64;

// execinfo.h, not bound by the libc crate on every target we support
extern "C" {
    fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
    fn backtrace_symbols(
        buffer: *const *mut libc::c_void,
        size: libc::c_int,
    ) -> *mut *mut libc::c_char;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Leading frames that belong to the capture machinery itself: this
        /// function, the fault handler, and the kernel signal trampoline.
        const CAPTURE_SKIP: usize = 3;
    } else {
        const CAPTURE_SKIP: usize = 2;
    }
}

/// Walks the current call stack into `frames`.
///
/// This is the restricted-context form: it does not allocate or lock, only
/// writing into the caller-provided buffer, so it is safe to run inside a
/// signal handler. The returned range covers the captured return addresses
/// trimmed of the capture machinery's own leading frames and the trailing
/// junk frame `backtrace(3)` always reports.
#[inline(never)]
pub(crate) fn capture_into(frames: &mut [usize; MAX_FRAMES]) -> Range<usize> {
    // usize and *mut c_void share a layout; keeping the buffer as integers
    // lets it live in a plain static
    let count = unsafe { backtrace(frames.as_mut_ptr().cast(), MAX_FRAMES as libc::c_int) };

    trim(count.max(0) as usize)
}

fn trim(count: usize) -> Range<usize> {
    if count > CAPTURE_SKIP + 1 {
        CAPTURE_SKIP..count - 1
    } else {
        0..count
    }
}

/// The textual form of each captured address, in the
/// `<module>(<symbol>+0x<offset>) [<addr>]` shape `backtrace_symbols(3)`
/// produces.
///
/// Allocates, so this must only run after capture has finished.
pub(crate) fn trace_lines(addrs: &[usize]) -> Vec<String> {
    unsafe {
        let raw = backtrace_symbols(addrs.as_ptr() as *const *mut libc::c_void, addrs.len() as libc::c_int);

        if raw.is_null() {
            return vec![String::new(); addrs.len()];
        }

        let lines = (0..addrs.len())
            .map(|i| {
                std::ffi::CStr::from_ptr(*raw.add(i))
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        // backtrace_symbols hands over a single malloc'd block
        libc::free(raw.cast());

        lines
    }
}
