use chrono::{DateTime, Local};

/// One captured call stack entry, innermost first.
pub struct StackFrame {
    /// Position in the captured stack, `0` being the innermost frame
    pub index: usize,
    /// The raw return address
    pub return_address: usize,
    /// Short name of the binary or library the address belongs to, when the
    /// stack walk could attribute it
    pub module: Option<String>,
    /// The resolved `function file:line` text, or the raw trace text when
    /// resolution failed. `None` means resolution was skipped entirely; the
    /// frame is still part of the report.
    pub location: Option<String>,
}

impl StackFrame {
    fn render(&self) -> String {
        cfg_if::cfg_if! {
            if #[cfg(all(unix, not(target_os = "macos")))] {
                format!(
                    "[{}] {} 0x{:016x} {}",
                    self.index,
                    self.module.as_deref().unwrap_or(""),
                    self.return_address,
                    self.location.as_deref().unwrap_or(""),
                )
            } else {
                format!(
                    "[{}] 0x{:016x} {}",
                    self.index,
                    self.return_address,
                    self.location.as_deref().unwrap_or(""),
                )
            }
        }
    }
}

/// The assembled crash report.
///
/// Built exactly once per fault and immutable thereafter. The rendered text
/// layout is a stable contract that downstream tooling (log shippers, issue
/// trackers) may parse:
///
/// ```text
/// <app> v<version>
/// <local timestamp>
///
/// <fault description>
///
/// [0] <module> 0x<16 hex digits> <location>
/// [1] ...
/// ```
pub struct CrashReport {
    /// The application name supplied at registration
    pub app_name: String,
    /// The application version supplied at registration
    pub app_version: String,
    /// When the fault was handled, in local time
    pub timestamp: DateTime<Local>,
    /// Human readable description of the fault class
    pub fault_description: String,
    /// The captured frames, innermost first
    pub frames: Vec<StackFrame>,
    rendered: String,
}

impl CrashReport {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        fault_description: impl Into<String>,
        frames: Vec<StackFrame>,
    ) -> Self {
        Self::at(app_name, app_version, fault_description, frames, Local::now())
    }

    fn at(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        fault_description: impl Into<String>,
        frames: Vec<StackFrame>,
        timestamp: DateTime<Local>,
    ) -> Self {
        let app_name = app_name.into();
        let app_version = app_version.into();
        let fault_description = fault_description.into();

        let mut lines = vec![
            format!("{app_name} v{app_version}"),
            timestamp.format("%d %b %Y @ %H:%M:%S").to_string(),
            String::new(),
            fault_description.clone(),
            String::new(),
        ];
        lines.extend(frames.iter().map(StackFrame::render));

        Self {
            app_name,
            app_version,
            timestamp,
            fault_description,
            frames,
            rendered: lines.join("\n"),
        }
    }

    /// The rendered report text.
    #[inline]
    pub fn text(&self) -> &str {
        &self.rendered
    }

    /// A file name for the persistence collaborator to write the report
    /// under, derived from the timestamp and application name.
    pub fn suggested_file_name(&self) -> String {
        format!(
            "{} {} Crash.log",
            self.timestamp.format("%Y%m%d-%H%M%S"),
            self.app_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn frame(index: usize, location: Option<&str>) -> StackFrame {
        StackFrame {
            index,
            return_address: 0x7f10_f281_9152 + index,
            module: Some("libc.so.6".to_owned()),
            location: location.map(str::to_owned),
        }
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2021, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn header_names_app_and_version() {
        let report = CrashReport::at(
            "TestApp",
            "1.2.3",
            "Caught SIGSEGV: Segmentation Fault",
            vec![],
            fixed_time(),
        );

        let mut lines = report.text().lines();
        assert_eq!(lines.next(), Some("TestApp v1.2.3"));
        assert_eq!(lines.next(), Some("14 Mar 2021 @ 15:09:26"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("Caught SIGSEGV: Segmentation Fault"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn renders_one_line_per_frame_in_order() {
        let report = CrashReport::at(
            "TestApp",
            "1.2.3",
            "Caught SIGFPE: (integer divide by zero)",
            vec![
                frame(0, Some("divide(int, int) at calc.cpp:12")),
                frame(1, None),
                frame(2, Some("main at main.cpp:40")),
            ],
            fixed_time(),
        );

        let frame_lines: Vec<_> = report.text().lines().skip(5).collect();
        assert_eq!(frame_lines.len(), 3);

        cfg_if::cfg_if! {
            if #[cfg(all(unix, not(target_os = "macos")))] {
                assert_eq!(
                    frame_lines[0],
                    "[0] libc.so.6 0x00007f10f2819152 divide(int, int) at calc.cpp:12"
                );
                // an unresolved frame keeps its slot in the sequence
                assert_eq!(frame_lines[1], "[1] libc.so.6 0x00007f10f2819153 ");
                assert_eq!(frame_lines[2], "[2] libc.so.6 0x00007f10f2819154 main at main.cpp:40");
            } else {
                assert_eq!(
                    frame_lines[0],
                    "[0] 0x00007f10f2819152 divide(int, int) at calc.cpp:12"
                );
                assert_eq!(frame_lines[1], "[1] 0x00007f10f2819153 ");
            }
        }
    }

    #[test]
    fn suggested_file_name_uses_timestamp_and_app_name() {
        let report = CrashReport::at("TestApp", "1.2.3", "x", vec![], fixed_time());
        assert_eq!(report.suggested_file_name(), "20210314-150926 TestApp Crash.log");
    }

    #[test]
    fn addresses_are_zero_padded_to_sixteen_digits() {
        let report = CrashReport::at(
            "TestApp",
            "1.2.3",
            "x",
            vec![StackFrame {
                index: 0,
                return_address: 0x40_1000,
                module: None,
                location: None,
            }],
            fixed_time(),
        );

        assert!(report.text().contains("0x0000000000401000"));
    }
}
