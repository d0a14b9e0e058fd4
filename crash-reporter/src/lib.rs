//! [`CrashReporter`] captures a stack trace when the process suffers a fatal
//! fault, resolves it to function/file/line text with an external debug tool,
//! and assembles a human-readable crash report for post-mortem diagnosis.
//!
//! # POSIX
//!
//! On unixes this is done by handling [signals](https://man7.org/linux/man-pages/man7/signal.7.html)
//! with a `SA_SIGINFO` handler running on a dedicated [alternate stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html),
//! so a report can be produced even when the fault is a stack overflow. The
//! intercepted set is
//!
//! * `SIGSEGV` - invalid virtual memory reference, including `null` pointer
//!   access and stack overflow
//! * `SIGFPE` - erroneous arithmetic operation, eg. integer division by zero
//! * `SIGILL` - illegal, malformed, or privileged instruction
//! * `SIGINT` - interactive attention (usually ctrl+c)
//! * `SIGTERM` - a termination request was sent to the process
//! * `SIGABRT` - `abort()`, usually from a failed assertion
//!
//! The call stack is walked with `backtrace(3)` into a preallocated buffer,
//! and each return address is handed to `addr2line` (`atos` on mac) for
//! resolution once capture has finished.
//!
//! # Windows
//!
//! On Windows a single top-level filter registered with
//! [`SetUnhandledExceptionFilter`](https://docs.microsoft.com/en-us/windows/win32/api/errhandlingapi/nf-errhandlingapi-setunhandledexceptionfilter)
//! covers all hardware exception codes. The stack is walked iteratively with
//! `StackWalk64` seeded from the exception's `CONTEXT` record, and addresses
//! are resolved with an `addr2line` tool shipped next to the application.
//!
//! # Lifecycle
//!
//! The reporting path is a one-way state machine:
//!
//! ```text
//! Armed -> Faulting -> Capturing -> Symbolizing -> Reporting -> Terminated
//! ```
//!
//! A fault always drives the process to termination; execution is never
//! resumed. The handler is **not** re-entrant: a second fault arriving while
//! one is already being handled is explicitly unhandled, as the design
//! assumes at most one fault per process lifetime. Callers needing stronger
//! guarantees must add their own serialization.

#![allow(unsafe_code)]

mod error;
mod report;
mod symbolize;

pub use error::Error;
pub use report::{CrashReport, StackFrame};
pub use symbolize::{ResolveAddress, Symbolizer};

pub use fault_context::FaultContext;

use std::{path::PathBuf, sync::atomic::AtomicU8, time::Duration};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        #[cfg(target_os = "windows")]
        libc::write(2, s.as_ptr().cast(), s.len() as u32);

        #[cfg(not(target_os = "windows"))]
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// The phases of the fault handling path.
///
/// The machine only ever advances; no transition leads back to [`Phase::Armed`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Handlers are installed, waiting for a fault
    Armed,
    /// A fault has been delivered to the handler entry point
    Faulting,
    /// Raw return addresses are being captured
    Capturing,
    /// Addresses are being resolved by the external debug tool
    Symbolizing,
    /// The report is being assembled and delivered
    Reporting,
    /// The report has been delivered, the process is about to exit
    Terminated,
}

static PHASE: AtomicU8 = AtomicU8::new(Phase::Armed as u8);

/// The phase the fault handling path is currently in.
///
/// Only meaningful once [`CrashReporter::install`] has succeeded.
pub fn phase() -> Phase {
    match PHASE.load(std::sync::atomic::Ordering::Acquire) {
        0 => Phase::Armed,
        1 => Phase::Faulting,
        2 => Phase::Capturing,
        3 => Phase::Symbolizing,
        4 => Phase::Reporting,
        _ => Phase::Terminated,
    }
}

pub(crate) fn advance_phase(phase: Phase) {
    PHASE.store(phase as u8, std::sync::atomic::Ordering::Release);
}

/// User implemented trait receiving the rendered report text once per
/// captured fault, after the [`Presenter`] has shown it.
///
/// # Safety
///
/// This trait is marked unsafe as care needs to be taken when implementing
/// it: it runs on the faulting thread, inside the fault handler invocation,
/// while the process memory may be in a compromised state. Do as little as
/// possible; the process terminates immediately afterwards.
pub unsafe trait ReportSink: Send + Sync {
    /// Invoked with the rendered report text.
    fn deliver(&self, report_text: &str);
}

/// Creates a [`ReportSink`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`ReportSink`] Safety section for information on why this is
/// `unsafe`.
#[inline]
pub unsafe fn make_report_sink<F>(closure: F) -> Box<dyn ReportSink>
where
    F: Send + Sync + Fn(&str) + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> ReportSink for Wrapper<F>
    where
        F: Send + Sync + Fn(&str),
    {
        fn deliver(&self, report_text: &str) {
            (self.inner)(report_text);
        }
    }

    Box::new(Wrapper { inner: closure })
}

/// The presentation collaborator, shown the assembled report before the
/// sink is invoked and the process terminates.
///
/// The reporting path blocks until `present` returns. The report surface
/// itself (a modal dialog in a GUI application) is outside the scope of this
/// crate; the default [`StderrPresenter`] just writes the report text to
/// stderr.
pub trait Presenter: Send + Sync {
    fn present(&self, report: &CrashReport);
}

/// Writes the rendered report to stderr.
pub struct StderrPresenter;

impl Presenter for StderrPresenter {
    fn present(&self, report: &CrashReport) {
        use std::io::Write as _;
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(report.text().as_bytes());
        let _ = stderr.write_all(b"\n");
    }
}

/// Configuration for [`CrashReporter::install`].
pub struct ReporterConfig {
    pub(crate) app_name: String,
    pub(crate) app_version: String,
    pub(crate) resolver: Option<PathBuf>,
    pub(crate) resolver_timeout: Duration,
    pub(crate) presenter: Option<Box<dyn Presenter>>,
}

impl ReporterConfig {
    /// Creates a configuration with the application name and version that
    /// will appear in the report header.
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            resolver: None,
            resolver_timeout: symbolize::DEFAULT_RESOLVER_TIMEOUT,
            presenter: None,
        }
    }

    /// Overrides the external debug tool used for symbol resolution.
    ///
    /// Defaults to `addr2line` found on the `PATH` (`atos` on mac, an
    /// `addr2line` shipped in `tools/` next to the executable on Windows).
    pub fn resolver(mut self, resolver: impl Into<PathBuf>) -> Self {
        self.resolver = Some(resolver.into());
        self
    }

    /// How long to wait for the debug tool before giving up on a frame.
    ///
    /// The tool is killed and the frame is left unresolved if it has not
    /// exited within this duration.
    pub fn resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    /// Sets the presentation collaborator. Defaults to [`StderrPresenter`].
    pub fn presenter(mut self, presenter: Box<dyn Presenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }
}

/// Installs process-wide fault interception.
pub struct CrashReporter;

impl CrashReporter {
    /// Installs the fault handlers and arms the reporting path.
    ///
    /// The optional `sink` is invoked once with the rendered report text
    /// after a fault has been captured and presented.
    ///
    /// Re-calling is accepted: the most recent registration is the active
    /// one. Whether the reserve stack of the prior registration is reused is
    /// unspecified.
    ///
    /// Failure to allocate the reserve stack or register the handlers is
    /// fatal: a message is written to stderr and the process aborts, keeping
    /// no partial state.
    pub fn install(config: ReporterConfig, sink: Option<Box<dyn ReportSink>>) -> Self {
        if let Err(err) = imp::attach(config, sink) {
            // SetupFailure is fatal by contract; a process that cannot report
            // its own crashes should not limp along believing it can
            use std::io::Write as _;
            let _ = writeln!(std::io::stderr(), "crash-reporter: failed to install fault handlers: {err}");
            std::process::abort();
        }

        advance_phase(Phase::Armed);
        log::debug!("fault handlers installed, reporting path armed");

        Self
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;

        use unix as imp;
    } else if #[cfg(target_os = "windows")] {
        mod windows;

        use windows as imp;
    }
}
