/// How close to the stack pointer a faulting address must be for a `SIGSEGV`
/// to be classified as a stack overflow.
///
/// A thread that runs off the end of its stack faults on the guard page,
/// which sits directly below the stack pointer, so a generous window is
/// still far smaller than any plausible heap mapping distance.
const STACK_OVERFLOW_WINDOW: usize = 64 * 1024;

// `si_code` values for SIGFPE and SIGILL, from `asm-generic/siginfo.h`.
// The `libc` crate does not expose these for linux-gnu targets.
#[cfg(target_os = "linux")]
mod si_codes {
    pub const FPE_INTDIV: libc::c_int = 1;
    pub const FPE_INTOVF: libc::c_int = 2;
    pub const FPE_FLTDIV: libc::c_int = 3;
    pub const FPE_FLTOVF: libc::c_int = 4;
    pub const FPE_FLTUND: libc::c_int = 5;
    pub const FPE_FLTRES: libc::c_int = 6;
    pub const FPE_FLTINV: libc::c_int = 7;
    pub const FPE_FLTSUB: libc::c_int = 8;
    pub const ILL_ILLOPC: libc::c_int = 1;
    pub const ILL_ILLOPN: libc::c_int = 2;
    pub const ILL_ILLADR: libc::c_int = 3;
    pub const ILL_ILLTRP: libc::c_int = 4;
    pub const ILL_PRVOPC: libc::c_int = 5;
    pub const ILL_PRVREG: libc::c_int = 6;
    pub const ILL_COPROC: libc::c_int = 7;
    pub const ILL_BADSTK: libc::c_int = 8;
}
#[cfg(not(target_os = "linux"))]
use libc as si_codes;

/// Contextual fault information on POSIX platforms.
///
/// Built inside the signal handler from the `siginfo_t` and `ucontext_t`
/// the kernel provides. Copies of the interesting values are taken rather
/// than pointers into them so the context stays valid for the whole
/// reporting path.
#[derive(Copy, Clone)]
pub struct FaultContext {
    /// The signal that was raised
    pub signal: i32,
    /// The `si_code` refining the signal, eg. `FPE_INTDIV` for `SIGFPE`
    pub code: i32,
    /// The address whose access raised the signal, if the signal carries one
    pub fault_address: usize,
    /// The stack pointer of the faulting thread
    pub stack_pointer: usize,
    /// The instruction pointer of the faulting thread
    pub instruction_pointer: usize,
}

impl FaultContext {
    /// Builds the context from the raw values passed to a `SA_SIGINFO`
    /// signal handler.
    ///
    /// # Safety
    ///
    /// `info` and `uc` must be the live pointers the kernel passed to the
    /// currently executing signal handler.
    pub unsafe fn from_raw(
        signal: i32,
        info: *const libc::siginfo_t,
        uc: *const libc::c_void,
    ) -> Self {
        let (stack_pointer, instruction_pointer) = machine_state(uc.cast());

        Self {
            signal,
            code: (*info).si_code,
            fault_address: fault_address(signal, info),
            stack_pointer,
            instruction_pointer,
        }
    }

    /// Whether this fault was (most likely) caused by exhausting the thread's
    /// stack.
    ///
    /// The kernel reports a stack overflow as a plain `SIGSEGV`, so this is a
    /// heuristic: the fault address landing in the guard region just past the
    /// stack pointer. On targets where the machine state cannot be read from
    /// the `ucontext_t` this always returns `false` and a full capture is
    /// attempted instead.
    #[inline]
    pub fn is_stack_overflow(&self) -> bool {
        self.signal == libc::SIGSEGV
            && self.stack_pointer != 0
            && self.fault_address.abs_diff(self.stack_pointer) < STACK_OVERFLOW_WINDOW
    }

    /// A human readable description of the fault.
    ///
    /// Returns a static string so that no allocation is needed while the
    /// process is in a compromised state. Unknown signals or sub-codes get a
    /// generic description rather than failing.
    pub fn describe(&self) -> &'static str {
        match self.signal {
            libc::SIGSEGV => "Caught SIGSEGV: Segmentation Fault",
            libc::SIGINT => "Caught SIGINT: Interactive attention signal, (usually ctrl+c)",
            libc::SIGFPE => match self.code {
                si_codes::FPE_INTDIV => "Caught SIGFPE: (integer divide by zero)",
                si_codes::FPE_INTOVF => "Caught SIGFPE: (integer overflow)",
                si_codes::FPE_FLTDIV => "Caught SIGFPE: (floating-point divide by zero)",
                si_codes::FPE_FLTOVF => "Caught SIGFPE: (floating-point overflow)",
                si_codes::FPE_FLTUND => "Caught SIGFPE: (floating-point underflow)",
                si_codes::FPE_FLTRES => "Caught SIGFPE: (floating-point inexact result)",
                si_codes::FPE_FLTINV => "Caught SIGFPE: (floating-point invalid operation)",
                si_codes::FPE_FLTSUB => "Caught SIGFPE: (subscript out of range)",
                _ => "Caught SIGFPE: Arithmetic Exception",
            },
            libc::SIGILL => match self.code {
                si_codes::ILL_ILLOPC => "Caught SIGILL: (illegal opcode)",
                si_codes::ILL_ILLOPN => "Caught SIGILL: (illegal operand)",
                si_codes::ILL_ILLADR => "Caught SIGILL: (illegal addressing mode)",
                si_codes::ILL_ILLTRP => "Caught SIGILL: (illegal trap)",
                si_codes::ILL_PRVOPC => "Caught SIGILL: (privileged opcode)",
                si_codes::ILL_PRVREG => "Caught SIGILL: (privileged register)",
                si_codes::ILL_COPROC => "Caught SIGILL: (coprocessor error)",
                si_codes::ILL_BADSTK => "Caught SIGILL: (internal stack error)",
                _ => "Caught SIGILL: Illegal Instruction",
            },
            libc::SIGTERM => "Caught SIGTERM: a termination request was sent to the program",
            libc::SIGABRT => "Caught SIGABRT: usually caused by an abort() or assert()",
            _ => "Unrecognized Signal",
        }
    }

    /// The instruction pointer of the faulting thread, used as the single
    /// recorded frame when a full capture is skipped.
    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.instruction_pointer
    }
}

/// `si_addr` is only meaningful for the memory/instruction faults; for
/// signals such as `SIGTERM` it is garbage (often the sending pid).
unsafe fn fault_address(signal: i32, info: *const libc::siginfo_t) -> usize {
    match signal {
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE => (*info).si_addr() as usize,
        _ => 0,
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        unsafe fn machine_state(uc: *const libc::ucontext_t) -> (usize, usize) {
            let gregs = &(*uc).uc_mcontext.gregs;
            (
                gregs[libc::REG_RSP as usize] as usize,
                gregs[libc::REG_RIP as usize] as usize,
            )
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        unsafe fn machine_state(uc: *const libc::ucontext_t) -> (usize, usize) {
            let mctx = &(*uc).uc_mcontext;
            (mctx.sp as usize, mctx.pc as usize)
        }
    } else {
        // The ucontext layout varies per OS/arch; on targets we haven't
        // mapped, stack overflow detection is disabled and a full capture is
        // attempted.
        unsafe fn machine_state(_uc: *const libc::ucontext_t) -> (usize, usize) {
            (0, 0)
        }
    }
}
