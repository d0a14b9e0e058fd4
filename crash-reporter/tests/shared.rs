#![allow(unsafe_code, dead_code)]

use crash_reporter as cr;

pub use mayhem_generator::Mayhem;

/// What the presenter and sink verify about the assembled report before the
/// test binary exits.
pub struct Expected {
    pub description_contains: &'static str,
    pub min_frames: usize,
    pub exact_frames: Option<usize>,
    /// When set, every frame must carry location text (the raw fallback when
    /// the resolver had no answer)
    pub all_locations_present: bool,
}

impl Default for Expected {
    fn default() -> Self {
        Self {
            description_contains: "",
            min_frames: 1,
            exact_frames: None,
            all_locations_present: false,
        }
    }
}

struct StructureCheck(Expected);

impl cr::Presenter for StructureCheck {
    fn present(&self, report: &cr::CrashReport) {
        assert!(
            report
                .fault_description
                .contains(self.0.description_contains),
            "fault description '{}' does not mention '{}'",
            report.fault_description,
            self.0.description_contains,
        );

        assert!(
            report.frames.len() >= self.0.min_frames,
            "expected at least {} frames, captured {}",
            self.0.min_frames,
            report.frames.len(),
        );

        if let Some(exact) = self.0.exact_frames {
            assert_eq!(report.frames.len(), exact);
        }

        // innermost first, no gaps
        for (i, frame) in report.frames.iter().enumerate() {
            assert_eq!(frame.index, i);
        }

        if self.0.all_locations_present {
            for frame in &report.frames {
                assert!(
                    frame.location.is_some(),
                    "frame {} has no location text",
                    frame.index
                );
            }
        }
    }
}

pub fn reports_crash(mayhem: Mayhem, expected: Expected) {
    reports_crash_with(mayhem, expected, |config| config);
}

pub fn reports_crash_with(
    mayhem: Mayhem,
    expected: Expected,
    tweak: impl FnOnce(cr::ReporterConfig) -> cr::ReporterConfig,
) {
    let description = expected.description_contains;

    let config = tweak(
        cr::ReporterConfig::new("mayhem-test", "1.0.0")
            .presenter(Box::new(StructureCheck(expected))),
    );

    let sink = unsafe {
        cr::make_report_sink(move |text: &str| {
            assert_eq!(cr::phase(), cr::Phase::Reporting);
            assert!(text.contains("mayhem-test v1.0.0"));
            assert!(text.contains(description));

            // Once we've verified the report we exit with a success code to
            // satisfy cargo test; there is only one test per binary, and the
            // process would terminate right after delivery anyway
            #[allow(clippy::exit)]
            std::process::exit(0);
        })
    };

    let _reporter = cr::CrashReporter::install(config, Some(sink));

    #[inline(never)]
    fn trouble(mayhem: Mayhem) {
        unsafe { mayhem.unleash() };
    }

    trouble(mayhem);

    panic!("this should be impossible");
}
