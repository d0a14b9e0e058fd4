/// Errors raised while installing the fault handlers or running the
/// external symbol resolver.
///
/// Note that nothing on the fault handling path itself surfaces these:
/// capture and resolution failures are absorbed so that a (possibly
/// degraded) report is always produced.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to map memory for the reserve handler stack
    #[error("unable to allocate the reserve handler stack")]
    ReserveStack,
    /// Registering the handler for the given signal failed
    #[error("unable to register a fault handler for signal {0}")]
    HandlerRegistration(i32),
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The symbol resolver was killed after exceeding its deadline
    #[error("the symbol resolver did not exit within {0:?}")]
    ResolverTimeout(std::time::Duration),
    /// The symbol resolver exited with a failure status
    #[error("the symbol resolver exited with status {0}")]
    ResolverFailed(std::process::ExitStatus),
}
