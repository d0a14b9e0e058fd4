use windows_sys::Win32::{Foundation as found, System::Diagnostics::Debug};

/// Contextual fault information on Windows.
pub struct FaultContext {
    /// The exception information.
    ///
    /// Note that this is a pointer into the stack of the faulting thread,
    /// only valid for the duration of the exception filter invocation
    pub exception_pointers: *const Debug::EXCEPTION_POINTERS,
    /// The top level exception code from the exception pointers, provided
    /// separately so the fault can be classified without chasing pointers
    pub exception_code: i32,
    /// The thread on which the exception occurred
    pub thread_id: u32,
}

impl FaultContext {
    /// Whether this fault is a stack overflow.
    ///
    /// Unlike POSIX, the structured exception model reports this as its own
    /// exception code, so no heuristic is needed.
    #[inline]
    pub fn is_stack_overflow(&self) -> bool {
        self.exception_code == found::EXCEPTION_STACK_OVERFLOW
    }

    /// A human readable description of the fault.
    ///
    /// Unknown exception codes get a generic description rather than failing.
    pub fn describe(&self) -> &'static str {
        match self.exception_code {
            found::EXCEPTION_ACCESS_VIOLATION => "EXCEPTION_ACCESS_VIOLATION",
            found::EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "EXCEPTION_ARRAY_BOUNDS_EXCEEDED",
            found::EXCEPTION_BREAKPOINT => "EXCEPTION_BREAKPOINT",
            found::EXCEPTION_DATATYPE_MISALIGNMENT => "EXCEPTION_DATATYPE_MISALIGNMENT",
            found::EXCEPTION_FLT_DENORMAL_OPERAND => "EXCEPTION_FLT_DENORMAL_OPERAND",
            found::EXCEPTION_FLT_DIVIDE_BY_ZERO => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
            found::EXCEPTION_FLT_INEXACT_RESULT => "EXCEPTION_FLT_INEXACT_RESULT",
            found::EXCEPTION_FLT_INVALID_OPERATION => "EXCEPTION_FLT_INVALID_OPERATION",
            found::EXCEPTION_FLT_OVERFLOW => "EXCEPTION_FLT_OVERFLOW",
            found::EXCEPTION_FLT_STACK_CHECK => "EXCEPTION_FLT_STACK_CHECK",
            found::EXCEPTION_FLT_UNDERFLOW => "EXCEPTION_FLT_UNDERFLOW",
            found::EXCEPTION_ILLEGAL_INSTRUCTION => "EXCEPTION_ILLEGAL_INSTRUCTION",
            found::EXCEPTION_IN_PAGE_ERROR => "EXCEPTION_IN_PAGE_ERROR",
            found::EXCEPTION_INT_DIVIDE_BY_ZERO => "EXCEPTION_INT_DIVIDE_BY_ZERO",
            found::EXCEPTION_INT_OVERFLOW => "EXCEPTION_INT_OVERFLOW",
            found::EXCEPTION_INVALID_DISPOSITION => "EXCEPTION_INVALID_DISPOSITION",
            found::EXCEPTION_NONCONTINUABLE_EXCEPTION => "EXCEPTION_NONCONTINUABLE_EXCEPTION",
            found::EXCEPTION_PRIV_INSTRUCTION => "EXCEPTION_PRIV_INSTRUCTION",
            found::EXCEPTION_SINGLE_STEP => "EXCEPTION_SINGLE_STEP",
            found::EXCEPTION_STACK_OVERFLOW => "EXCEPTION_STACK_OVERFLOW",
            _ => "Unrecognized Exception",
        }
    }

    /// The instruction pointer of the faulting thread, used as the single
    /// recorded frame when a full capture is skipped.
    ///
    /// # Safety
    ///
    /// `exception_pointers` must still be valid, ie. this must be called
    /// within the exception filter invocation this context was built from.
    pub unsafe fn instruction_pointer(&self) -> usize {
        let record = (*self.exception_pointers).ContextRecord;

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                (*record).Rip as usize
            } else if #[cfg(target_arch = "x86")] {
                (*record).Eip as usize
            } else {
                compile_error!("unimplemented target architecture");
            }
        }
    }
}
