//! Portable types describing the state of a process at the instant it
//! suffered a fatal fault.
//!
//! A [`FaultContext`] is a snapshot of what the OS reported about the fault:
//! the fault class (signal number + `si_code` on POSIX, exception code on
//! Windows) and the minimal machine state needed to begin stack walking. It
//! is produced inside the fault handler itself and is therefore built from
//! nothing but the values the OS hands the handler; no allocation takes
//! place.
//!
//! The [`FaultContext::describe`] tables return `&'static str` so a fault
//! description can be obtained without touching the heap while the process
//! is in a compromised state.

#![allow(unsafe_code)]

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::*;
    }
}
