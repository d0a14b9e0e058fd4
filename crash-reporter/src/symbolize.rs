use crate::Error;
use std::{
    io::Read as _,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

pub(crate) const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);

const RESOLVER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The address resolution seam.
///
/// Implemented by [`Symbolizer`] for production use; tests inject fakes to
/// exercise the frame pipeline without an external tool.
pub trait ResolveAddress {
    /// Resolves `address` within `module` to a `function file:line` text.
    ///
    /// `None` means "no information": the tool was missing, failed, timed
    /// out, or had no symbol for the address. It never aborts the report.
    fn resolve(&self, module: &Path, address: usize) -> Option<String>;
}

/// Resolves addresses by invoking an external OS debug tool and reading its
/// one-line answer.
///
/// Invocations are strictly sequential, one frame at a time; spawning
/// overlapping subprocesses from a process whose memory may already be
/// corrupted is not worth the speedup.
pub struct Symbolizer {
    program: PathBuf,
    executable: PathBuf,
    timeout: Duration,
}

impl Symbolizer {
    /// Creates a symbolizer for the given executable.
    ///
    /// `resolver` overrides the external tool; when `None` the platform
    /// default is used (`addr2line` from the `PATH`, `atos` on mac, the
    /// `addr2line` shipped in `tools/` next to the executable on Windows).
    pub fn new(executable: PathBuf, resolver: Option<PathBuf>, timeout: Duration) -> Self {
        let program = resolver.unwrap_or_else(|| default_resolver(&executable));

        Self {
            program,
            executable,
            timeout,
        }
    }

    /// The executable whose addresses this symbolizer resolves.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn run(&self, module: &Path, addr: &str) -> Result<String, Error> {
        let mut cmd = Command::new(&self.program);

        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                let _ = module;
                cmd.arg("-o")
                    .arg(&self.executable)
                    .args(["-arch", "x86_64"])
                    .arg(addr);
            } else {
                cmd.args(["-C", "-f", "-p", "-s", "-e"]).arg(module).arg(addr);
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let status = self.wait_bounded(&mut child)?;

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output)?;
        }

        if !status.success() {
            return Err(Error::ResolverFailed(status));
        }

        Ok(output)
    }

    /// Waits for the resolver with an explicit deadline rather than an
    /// unbounded `wait`, so an unresponsive tool cannot stall the rest of
    /// the report.
    fn wait_bounded(&self, child: &mut Child) -> Result<ExitStatus, Error> {
        let deadline = Instant::now() + self.timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }

            if Instant::now() >= deadline {
                log::warn!(
                    "symbol resolver '{}' did not exit within {:?}, killing it",
                    self.program.display(),
                    self.timeout
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::ResolverTimeout(self.timeout));
            }

            std::thread::sleep(RESOLVER_POLL_INTERVAL);
        }
    }
}

impl ResolveAddress for Symbolizer {
    fn resolve(&self, module: &Path, address: usize) -> Option<String> {
        let addr = format!("0x{address:016x}");

        match self.run(module, &addr) {
            Ok(output) => {
                let location = output.trim();

                // Many tools echo the address back verbatim when they have no
                // symbol for it; that is "no information", not a resolution
                if location.is_empty() || location == addr {
                    None
                } else {
                    Some(location.to_owned())
                }
            }
            Err(err) => {
                log::debug!("failed to resolve {addr} in '{}': {err}", module.display());
                None
            }
        }
    }
}

fn default_resolver(executable: &Path) -> PathBuf {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            let _ = executable;
            PathBuf::from("atos")
        } else if #[cfg(target_os = "windows")] {
            match executable.parent() {
                Some(dir) => dir.join("tools").join("addr2line.exe"),
                None => PathBuf::from("addr2line.exe"),
            }
        } else {
            let _ = executable;
            PathBuf::from("addr2line")
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, not(target_os = "macos")))] {
        use once_cell::sync::Lazy;
        use regex::Regex;

        /// Splits a `backtrace_symbols(3)` line into the module path, the
        /// symbol-relative offset, and the absolute return address.
        ///
        /// Example:
        /// `/usr/lib/libc.so.6(__libc_start_main+0xf2) [0x7f10f2819152]`
        static TRACE_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(.*)\(.*\+0x([^ ]+)\).*\[([^ ]+)\]$").expect("trace line pattern is valid")
        });

        pub(crate) struct TraceLine<'l> {
            pub module: &'l str,
            pub offset: usize,
        }

        pub(crate) fn warm_up_diag() { once_cell::sync::Lazy::force(&TRACE_LINE); }

        pub(crate) fn parse_trace_line(line: &str) -> Option<TraceLine<'_>> {
            let caps = TRACE_LINE.captures(line)?;
            let module = caps.get(1)?.as_str();
            let offset = usize::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;

            Some(TraceLine { module, offset })
        }

        /// Builds one report frame from a raw trace line, resolving the
        /// in-module offset through the debug tool.
        ///
        /// Lines that don't look like `<module>(<symbol>+0x<offset>) [<addr>]`
        /// fall back to the raw text, as do lines the resolver has no answer
        /// for. Resolution failure never drops the frame.
        pub(crate) fn build_frame(
            index: usize,
            return_address: usize,
            line: &str,
            _executable: &Path,
            resolver: &dyn ResolveAddress,
        ) -> crate::StackFrame {
            match parse_trace_line(line) {
                Some(trace) => {
                    let location = resolver
                        .resolve(Path::new(trace.module), trace.offset)
                        .unwrap_or_else(|| fallback_text(line));

                    crate::StackFrame {
                        index,
                        return_address,
                        module: module_display_name(trace.module),
                        location: Some(location),
                    }
                }
                None => crate::StackFrame {
                    index,
                    return_address,
                    module: None,
                    location: Some(fallback_text(line)),
                },
            }
        }
    } else if #[cfg(target_os = "macos")] {
        pub(crate) fn build_frame(
            index: usize,
            return_address: usize,
            line: &str,
            executable: &Path,
            resolver: &dyn ResolveAddress,
        ) -> crate::StackFrame {
            let location = resolver
                .resolve(executable, return_address)
                .unwrap_or_else(|| fallback_text(line));

            crate::StackFrame {
                index,
                return_address,
                module: None,
                location: Some(location),
            }
        }
    }
}

/// The raw trace line with the trailing ` [0x…]` clause stripped, used as the
/// resolved text when no better answer is available.
#[cfg(unix)]
pub(crate) fn fallback_text(line: &str) -> String {
    match line.rfind(" [0x") {
        Some(index) => line[..index].to_owned(),
        None => line.to_owned(),
    }
}

/// `/usr/lib/libc.so.6` -> `libc.so.6`
#[cfg(all(unix, not(target_os = "macos")))]
fn module_display_name(path: &str) -> Option<String> {
    let name = match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    };

    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(all(test, unix, not(target_os = "macos")))]
mod tests {
    use super::*;

    const LIBC_LINE: &str = "/usr/lib/libc.so.6(__libc_start_main+0xf2) [0x7f10f2819152]";

    struct NeverResolves;

    impl ResolveAddress for NeverResolves {
        fn resolve(&self, _module: &Path, _address: usize) -> Option<String> {
            None
        }
    }

    /// Only resolves even offsets, to model per-frame resolver failure
    struct EvenOffsetsOnly;

    impl ResolveAddress for EvenOffsetsOnly {
        fn resolve(&self, _module: &Path, address: usize) -> Option<String> {
            (address % 2 == 0).then(|| format!("resolved+0x{address:x}"))
        }
    }

    #[test]
    fn parses_a_gcc_style_trace_line() {
        let trace = parse_trace_line(LIBC_LINE).unwrap();
        assert_eq!(trace.module, "/usr/lib/libc.so.6");
        assert_eq!(trace.offset, 0xf2);
    }

    #[test]
    fn rejects_lines_without_offset_and_address() {
        assert!(parse_trace_line("???").is_none());
        assert!(parse_trace_line("/usr/bin/app() [not-hex]").is_none());
        assert!(parse_trace_line("").is_none());
    }

    #[test]
    fn fallback_strips_the_address_clause() {
        assert_eq!(
            fallback_text(LIBC_LINE),
            "/usr/lib/libc.so.6(__libc_start_main+0xf2)"
        );
        assert_eq!(fallback_text("no clause here"), "no clause here");
    }

    #[test]
    fn unparseable_line_becomes_the_frame_text() {
        let frame = build_frame(0, 0xdead, "[vdso]", Path::new("/x"), &NeverResolves);
        assert_eq!(frame.module, None);
        assert_eq!(frame.location.as_deref(), Some("[vdso]"));
    }

    #[test]
    fn resolver_failure_never_drops_frames() {
        let lines = [
            "/usr/bin/app(f1+0x2) [0x400002]",
            "/usr/bin/app(f2+0x3) [0x400003]",
            "/usr/bin/app(f3+0x4) [0x400004]",
        ];

        let frames: Vec<_> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| build_frame(i, 0x400002 + i, line, Path::new("/x"), &EvenOffsetsOnly))
            .collect();

        // every frame survives, failed ones carry the raw fallback text
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].location.as_deref(), Some("resolved+0x2"));
        assert_eq!(frames[1].location.as_deref(), Some("/usr/bin/app(f2+0x3)"));
        assert_eq!(frames[2].location.as_deref(), Some("resolved+0x4"));

        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i);
            assert_eq!(frame.module.as_deref(), Some("app"));
        }
    }

    fn fake_resolver(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = dir.path().join("fake-addr2line");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn symbolizer(tool: PathBuf, timeout: Duration) -> Symbolizer {
        Symbolizer::new(PathBuf::from("/usr/bin/app"), Some(tool), timeout)
    }

    #[test]
    fn resolves_through_the_external_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_resolver(&dir, r#"echo "divide(int, int) at calc.cpp:12""#);

        let sym = symbolizer(tool, DEFAULT_RESOLVER_TIMEOUT);
        assert_eq!(
            sym.resolve(Path::new("/usr/bin/app"), 0xf2).as_deref(),
            Some("divide(int, int) at calc.cpp:12")
        );
    }

    #[test]
    fn echoed_back_address_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        // addr2line prints the queried address verbatim when it has nothing;
        // the address is the last argument
        let tool = fake_resolver(&dir, r#"echo "$7""#);

        let sym = symbolizer(tool, DEFAULT_RESOLVER_TIMEOUT);
        assert_eq!(sym.resolve(Path::new("/usr/bin/app"), 0xf2), None);
    }

    #[test]
    fn missing_tool_is_a_miss() {
        let sym = symbolizer(
            PathBuf::from("/nonexistent/really-not-addr2line"),
            DEFAULT_RESOLVER_TIMEOUT,
        );
        assert_eq!(sym.resolve(Path::new("/usr/bin/app"), 0xf2), None);
    }

    #[test]
    fn failing_tool_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_resolver(&dir, "exit 3");

        let sym = symbolizer(tool, DEFAULT_RESOLVER_TIMEOUT);
        assert_eq!(sym.resolve(Path::new("/usr/bin/app"), 0xf2), None);
    }

    #[test]
    fn unresponsive_tool_is_killed_at_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_resolver(&dir, "sleep 30");

        let sym = symbolizer(tool, Duration::from_millis(200));

        let start = Instant::now();
        assert_eq!(sym.resolve(Path::new("/usr/bin/app"), 0xf2), None);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
