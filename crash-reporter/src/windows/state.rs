use crate::{
    advance_phase, debug_print, CrashReport, Error, Phase, Presenter, ReportSink, ResolveAddress,
    StackFrame, StderrPresenter, Symbolizer,
};
use fault_context::FaultContext;
use std::{ffi::c_void, mem, ptr};
use windows_sys::Win32::{
    Foundation::{BOOL, HANDLE},
    System::{
        Diagnostics::Debug::{AddrModeFlat, ADDRESS64, CONTEXT, EXCEPTION_POINTERS, STACKFRAME64},
        Threading::{GetCurrentProcess, GetCurrentThread, GetCurrentThreadId},
    },
};

/// Fixed capacity of the capture buffer.
const MAX_FRAMES: usize = 64;

/// Enter the exception handler; usually results in the process terminating.
const EXCEPTION_EXECUTE_HANDLER: i32 = 1;

const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;

type LPTOP_LEVEL_EXCEPTION_FILTER =
    Option<unsafe extern "system" fn(exception_info: *const EXCEPTION_POINTERS) -> i32>;

extern "system" {
    fn SetUnhandledExceptionFilter(
        filter: LPTOP_LEVEL_EXCEPTION_FILTER,
    ) -> LPTOP_LEVEL_EXCEPTION_FILTER;
}

type PREAD_PROCESS_MEMORY_ROUTINE64 = Option<
    unsafe extern "system" fn(HANDLE, u64, *mut c_void, u32, *mut u32) -> BOOL,
>;
type PFUNCTION_TABLE_ACCESS_ROUTINE64 =
    Option<unsafe extern "system" fn(HANDLE, u64) -> *mut c_void>;
type PGET_MODULE_BASE_ROUTINE64 = Option<unsafe extern "system" fn(HANDLE, u64) -> u64>;
type PTRANSLATE_ADDRESS_ROUTINE64 =
    Option<unsafe extern "system" fn(HANDLE, HANDLE, *const ADDRESS64) -> u64>;

#[link(name = "dbghelp")]
extern "system" {
    fn SymInitialize(process: HANDLE, user_search_path: *const u8, invade_process: BOOL) -> BOOL;
    fn SymCleanup(process: HANDLE) -> BOOL;
    fn SymFunctionTableAccess64(process: HANDLE, addr_base: u64) -> *mut c_void;
    fn SymGetModuleBase64(process: HANDLE, addr: u64) -> u64;
    #[allow(clippy::too_many_arguments)]
    fn StackWalk64(
        machine_type: u32,
        process: HANDLE,
        thread: HANDLE,
        stack_frame: *mut STACKFRAME64,
        context_record: *mut c_void,
        read_memory_routine: PREAD_PROCESS_MEMORY_ROUTINE64,
        function_table_access_routine: PFUNCTION_TABLE_ACCESS_ROUTINE64,
        get_module_base_routine: PGET_MODULE_BASE_ROUTINE64,
        translate_address_routine: PTRANSLATE_ADDRESS_ROUTINE64,
    ) -> BOOL;
}

static HANDLER: parking_lot::Mutex<Option<HandlerInner>> = parking_lot::const_mutex(None);

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

    let inner = HandlerInner {
        app_name: config.app_name,
        app_version: config.app_version,
        symbolizer: Symbolizer::new(executable, config.resolver, config.resolver_timeout),
        presenter: config.presenter.unwrap_or_else(|| Box::new(StderrPresenter)),
        sink,
    };

    let mut lock = HANDLER.lock();

    if lock.is_none() {
        // SAFETY: syscall
        unsafe {
            SetUnhandledExceptionFilter(Some(exception_filter));
        }
    }

    // Re-registration is accepted: the most recent one wins and the filter
    // stays in place
    *lock = Some(inner);

    Ok(())
}

/// The single top-level filter covering all hardware exception codes,
/// invoked by the OS on the faulting thread.
///
/// Not re-entrant: a second exception arriving while this is running is
/// explicitly unhandled.
unsafe extern "system" fn exception_filter(exception_info: *const EXCEPTION_POINTERS) -> i32 {
    advance_phase(Phase::Faulting);
    debug_print!("exception delivered");

    let fault = FaultContext {
        exception_pointers: exception_info,
        exception_code: (*(*exception_info).ExceptionRecord).ExceptionCode,
        thread_id: GetCurrentThreadId(),
    };

    {
        let handler = HANDLER.lock();
        if let Some(handler) = &*handler {
            handler.handle_fault(&fault);
        }
    }

    advance_phase(Phase::Terminated);

    // The "continue execution" arm of the structured exception model is
    // never exercised; the process proceeds to termination
    EXCEPTION_EXECUTE_HANDLER
}

impl HandlerInner {
    unsafe fn handle_fault(&self, fault: &FaultContext) {
        advance_phase(Phase::Capturing);

        let frames = if fault.is_stack_overflow() {
            // There is too little stack margin left to walk; record only
            // where the fault happened
            debug_print!("stack overflow, skipping full capture");
            self.single_frame(fault.instruction_pointer())
        } else {
            let mut addrs = [0usize; MAX_FRAMES];
            let count = walk_stack((*fault.exception_pointers).ContextRecord, &mut addrs);

            advance_phase(Phase::Symbolizing);

            addrs[..count]
                .iter()
                .enumerate()
                .map(|(index, addr)| StackFrame {
                    index,
                    return_address: *addr,
                    module: None,
                    location: self
                        .symbolizer
                        .resolve(self.symbolizer.executable(), *addr),
                })
                .collect()
        };

        advance_phase(Phase::Reporting);

        let report = CrashReport::new(&self.app_name, &self.app_version, fault.describe(), frames);

        self.presenter.present(&report);

        if let Some(sink) = &self.sink {
            sink.deliver(report.text());
        }
    }

    fn single_frame(&self, address: usize) -> Vec<StackFrame> {
        advance_phase(Phase::Symbolizing);

        vec![StackFrame {
            index: 0,
            return_address: address,
            module: None,
            location: self
                .symbolizer
                .resolve(self.symbolizer.executable(), address),
        }]
    }
}

/// The context-supplied capture form: walks frames iteratively from the
/// exception's machine context, one return address per step, until the walk
/// is exhausted or the buffer is full.
unsafe fn walk_stack(context: *mut CONTEXT, out: &mut [usize; MAX_FRAMES]) -> usize {
    let process = GetCurrentProcess();
    let thread = GetCurrentThread();

    SymInitialize(process, ptr::null(), 1);

    let mut frame: STACKFRAME64 = mem::zeroed();

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86")] {
            let image = IMAGE_FILE_MACHINE_I386;

            frame.AddrPC.Offset = (*context).Eip as u64;
            frame.AddrStack.Offset = (*context).Esp as u64;
            frame.AddrFrame.Offset = (*context).Ebp as u64;
        } else if #[cfg(target_arch = "x86_64")] {
            let image = IMAGE_FILE_MACHINE_AMD64;

            frame.AddrPC.Offset = (*context).Rip;
            frame.AddrStack.Offset = (*context).Rsp;
            frame.AddrFrame.Offset = (*context).Rsp;
        } else {
            compile_error!("unimplemented target architecture");
        }
    }

    frame.AddrPC.Mode = AddrModeFlat;
    frame.AddrStack.Mode = AddrModeFlat;
    frame.AddrFrame.Mode = AddrModeFlat;

    let mut count = 0;
    while count < MAX_FRAMES
        && StackWalk64(
            image,
            process,
            thread,
            &mut frame,
            context.cast(),
            None,
            Some(SymFunctionTableAccess64),
            Some(SymGetModuleBase64),
            None,
        ) != 0
    {
        out[count] = frame.AddrPC.Offset as usize;
        count += 1;
    }

    SymCleanup(process);

    count
}
