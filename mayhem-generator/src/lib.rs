//! Ways to make a process fault on purpose, for exercising fault handlers
//! in integration tests.
//!
//! Each raiser is `#[inline(never)]` so the faulting call shows up as its
//! own stack frame.

#![allow(unsafe_code)]

#[cfg(target_arch = "x86_64")]
use std::arch::asm;

/// The supported ways of ruining this process's day.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mayhem {
    /// `SIGABRT` on unix, an abort exception on windows
    Abort,
    /// `SIGFPE` on unix, `EXCEPTION_INT_DIVIDE_BY_ZERO` on windows
    DivideByZero,
    /// `SIGILL` on unix, `EXCEPTION_ILLEGAL_INSTRUCTION` on windows
    Illegal,
    /// `SIGSEGV` on unix, `EXCEPTION_ACCESS_VIOLATION` on windows
    NullWrite,
    /// `SIGSEGV` on unix (guard page), `EXCEPTION_STACK_OVERFLOW` on windows
    StackOverflow,
}

impl Mayhem {
    /// Actually unleashes the chosen mayhem.
    ///
    /// # Safety
    ///
    /// This intentionally faults the process. It only ever "returns" if the
    /// installed fault handler resumes execution, which a sane one does not.
    pub unsafe fn unleash(self) {
        match self {
            Self::Abort => raise_abort(),
            Self::DivideByZero => raise_divide_by_zero(),
            Self::Illegal => raise_illegal_instruction(),
            Self::NullWrite => raise_null_write(),
            Self::StackOverflow => raise_stack_overflow(),
        }
    }
}

/// Raises `SIGABRT` on unix and an abort exception on windows.
#[inline(never)]
pub fn raise_abort() {
    std::process::abort();
}

/// Raises `SIGFPE` on unix and an `EXCEPTION_INT_DIVIDE_BY_ZERO` exception
/// on windows.
///
/// On x86-64 this performs an actual `idiv` by zero so the kernel reports
/// `FPE_INTDIV`; other architectures don't trap integer division so the
/// signal is raised directly there.
#[inline(never)]
pub fn raise_divide_by_zero() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let ohno = unsafe {
                let mut divisor: u32;
                asm!(
                    "mov eax, 1",
                    "cdq",
                    "mov {div:e}, 0",
                    "idiv {div:e}",
                    div = out(reg) divisor
                );
                divisor
            };

            println!("we are crashing by dividing by zero: {ohno}");
        } else if #[cfg(unix)] {
            unsafe {
                libc::raise(libc::SIGFPE);
            }
        } else {
            unimplemented!("no divide-by-zero trap on this target");
        }
    }
}

/// Raises `SIGILL` on unix and an `EXCEPTION_ILLEGAL_INSTRUCTION` exception
/// on windows.
#[inline(never)]
pub fn raise_illegal_instruction() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { asm!("ud2") };
        } else if #[cfg(target_arch = "aarch64")] {
            unsafe { std::arch::asm!("udf #0") };
        } else if #[cfg(unix)] {
            unsafe {
                libc::raise(libc::SIGILL);
            }
        } else {
            unimplemented!("no illegal instruction for this target");
        }
    }
}

/// Raises `SIGSEGV` on unix and an `EXCEPTION_ACCESS_VIOLATION` exception on
/// windows by writing through a null pointer.
#[inline(never)]
pub fn raise_null_write() {
    // avoid the deref_nullptr lint
    fn definitely_not_null() -> *mut u32 {
        std::ptr::null_mut()
    }

    unsafe {
        std::ptr::write_volatile(definitely_not_null(), 42);
    }
}

/// Overflows the stack via unbounded recursion, raising `SIGSEGV` on the
/// guard page on unix and an `EXCEPTION_STACK_OVERFLOW` exception on
/// windows.
#[inline(never)]
pub fn raise_stack_overflow() {
    #[inline(never)]
    fn recurse(depth: usize) -> usize {
        let mut filler = [depth; 256];
        std::hint::black_box(&mut filler);

        recurse(depth + 1) + filler[0]
    }

    println!("we are crashing by recursing forever: {}", recurse(0));
}
