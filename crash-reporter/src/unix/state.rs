use super::capture::{self, MAX_FRAMES};
use crate::{
    advance_phase, debug_print, symbolize, CrashReport, Error, Phase, Presenter, ReportSink,
    ResolveAddress, StackFrame, StderrPresenter, Symbolizer,
};
use fault_context::FaultContext;
use std::{mem, ptr};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the reserve stack the handler runs on.
///
/// This has a minimum size of 16k; the memory is only ever committed if a
/// fault actually arrives, and a fresh stack is the only way the handler can
/// run at all when the fault is a stack overflow.
const SIG_STACK_SIZE: usize = get_stack_size();

/// The fixed set of signals registered for interception.
const REPORTED_SIGNALS: [i32; 6] = [
    libc::SIGSEGV,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGABRT,
];

/// Maps a reserve execution stack and registers it with `sigaltstack` so the
/// handler can run even when the normal stack is exhausted.
///
/// If the thread already has an alternate stack at least as big as we would
/// map, it is kept.
unsafe fn install_reserve_stack() -> Result<(), Error> {
    let mut old_stack = mem::zeroed();
    if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
        return Ok(());
    }

    // Map one extra guard page below the stack, left PROT_NONE, so that
    // overflowing the reserve stack itself faults cleanly instead of
    // scribbling over unrelated memory.
    let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let alloc_size = guard_size + SIG_STACK_SIZE;

    let mapping = libc::mmap(
        ptr::null_mut(),
        alloc_size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if mapping == libc::MAP_FAILED {
        return Err(Error::ReserveStack);
    }

    let stack_ptr = (mapping as usize + guard_size) as *mut libc::c_void;
    if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        libc::munmap(mapping, alloc_size);
        return Err(Error::ReserveStack);
    }

    let new_stack = libc::stack_t {
        ss_sp: stack_ptr,
        ss_flags: 0,
        ss_size: SIG_STACK_SIZE,
    };
    if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
        let err = std::io::Error::last_os_error();
        libc::munmap(mapping, alloc_size);
        return Err(err.into());
    }

    Ok(())
}

/// Registers the fault handler for every signal in [`REPORTED_SIGNALS`].
///
/// On failure nothing stays registered: signals that were already hooked are
/// reset to their default action before the error is returned.
unsafe fn install_handlers() -> Result<(), Error> {
    let mut sa: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut sa.sa_mask);

    // Mask the whole reported set while handling one of them
    for sig in REPORTED_SIGNALS {
        libc::sigaddset(&mut sa.sa_mask, sig);
    }

    sa.sa_sigaction = signal_handler as usize;
    sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

    for sig in REPORTED_SIGNALS {
        if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
            for installed in REPORTED_SIGNALS {
                libc::signal(installed, libc::SIG_DFL);
            }
            return Err(Error::HandlerRegistration(sig));
        }
    }

    Ok(())
}

static HANDLER: parking_lot::Mutex<Option<HandlerInner>> = parking_lot::const_mutex(None);

/// The capture buffer is kept out of the handler's stack frame since the
/// reserve stack is small. Keep it as a .bss field.
static CAPTURE_BUF: parking_lot::Mutex<[usize; MAX_FRAMES]> =
    parking_lot::const_mutex([0; MAX_FRAMES]);

pub(crate) struct HandlerInner {
    app_name: String,
    app_version: String,
    symbolizer: Symbolizer,
    presenter: Box<dyn Presenter>,
    sink: Option<Box<dyn ReportSink>>,
}

pub(crate) fn attach(
    config: crate::ReporterConfig,
    sink: Option<Box<dyn ReportSink>>,
) -> Result<(), Error> {
    let executable = std::env::current_exe()?;
    symbolize::warm_up_diag();

    let inner = HandlerInner {
        app_name: config.app_name,
        app_version: config.app_version,
        symbolizer: Symbolizer::new(executable, config.resolver, config.resolver_timeout),
        presenter: config.presenter.unwrap_or_else(|| Box::new(StderrPresenter)),
        sink,
    };

    let mut lock = HANDLER.lock();

    if lock.is_none() {
        // SAFETY: syscalls
        unsafe {
            install_reserve_stack()?;
            install_handlers()?;
        }
    }

    // Re-registration is accepted: the most recent one wins and the handler
    // entry points stay in place. Whether the previous reserve stack is
    // reused is unspecified.
    *lock = Some(inner);

    Ok(())
}

/// The function installed for each reported signal, invoked by the kernel on
/// the reserve stack.
///
/// Not re-entrant: a second fault arriving while this is running is
/// explicitly unhandled.
unsafe extern "C" fn signal_handler(
    sig: i32,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    advance_phase(Phase::Faulting);
    debug_print!("fault signal delivered");

    let fault = FaultContext::from_raw(sig, info, uc);

    {
        let handler = HANDLER.lock();
        if let Some(handler) = &*handler {
            handler.handle_fault(&fault);
        }
    }

    advance_phase(Phase::Terminated);

    // Execution is never resumed after a fault
    libc::_exit(1);
}

impl HandlerInner {
    fn handle_fault(&self, fault: &FaultContext) {
        advance_phase(Phase::Capturing);

        let frames = if fault.is_stack_overflow() {
            // Walking a stack that has just overflowed is unsafe, there is
            // almost no margin left. Record only the faulting address.
            debug_print!("stack overflow, skipping full capture");
            self.single_frame(fault.instruction_pointer())
        } else {
            let mut buf = CAPTURE_BUF.lock();
            let range = capture::capture_into(&mut buf);
            debug_print!("raw addresses captured");

            advance_phase(Phase::Symbolizing);

            let addrs: &[usize] = &buf[range];
            let lines = capture::trace_lines(addrs);

            addrs
                .iter()
                .zip(lines.iter())
                .enumerate()
                .map(|(index, (addr, line))| {
                    symbolize::build_frame(
                        index,
                        *addr,
                        line,
                        self.symbolizer.executable(),
                        &self.symbolizer,
                    )
                })
                .collect()
        };

        advance_phase(Phase::Reporting);

        let report = CrashReport::new(&self.app_name, &self.app_version, fault.describe(), frames);

        // The presentation collaborator is shown the report first; the
        // delivery sink fires once it returns
        self.presenter.present(&report);

        if let Some(sink) = &self.sink {
            sink.deliver(report.text());
        }
    }

    fn single_frame(&self, address: usize) -> Vec<StackFrame> {
        advance_phase(Phase::Symbolizing);

        let module = self
            .symbolizer
            .executable()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        vec![StackFrame {
            index: 0,
            return_address: address,
            module,
            location: self
                .symbolizer
                .resolve(self.symbolizer.executable(), address),
        }]
    }
}
