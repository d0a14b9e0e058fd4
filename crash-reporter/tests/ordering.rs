#![allow(unsafe_code)]

use crash_reporter as cr;
use mayhem_generator::Mayhem;

/// How far past a function's entry point a captured address may land and
/// still be attributed to it. The chain helpers below compile to far less
/// code than this.
const FN_SPAN: usize = 0x1000;

/// Checks that a known call chain comes out innermost first: the faulting
/// leaf's frame before its caller's, the caller's before the one above it.
struct ChainOrder {
    leaf: usize,
    middle: usize,
    outer: usize,
}

impl cr::Presenter for ChainOrder {
    fn present(&self, report: &cr::CrashReport) {
        let position = |entry: usize| {
            report
                .frames
                .iter()
                .position(|f| f.return_address >= entry && f.return_address < entry + FN_SPAN)
        };

        let leaf = position(self.leaf).expect("the faulting leaf is missing from the capture");
        let middle = position(self.middle).expect("the middle of the chain is missing");
        let outer = position(self.outer).expect("the top of the chain is missing");

        assert!(
            leaf < middle && middle < outer,
            "frames are not innermost first: leaf at [{leaf}], middle at [{middle}], outer at [{outer}]"
        );
    }
}

#[inline(never)]
fn faulting_leaf() {
    unsafe { Mayhem::NullWrite.unleash() };
    std::hint::black_box(());
}

#[inline(never)]
fn calls_the_leaf() {
    faulting_leaf();
    // keep this frame on the stack rather than a tail call
    std::hint::black_box(());
}

#[inline(never)]
fn starts_the_chain() {
    calls_the_leaf();
    std::hint::black_box(());
}

#[test]
fn frames_are_innermost_first() {
    let presenter = ChainOrder {
        leaf: faulting_leaf as usize,
        middle: calls_the_leaf as usize,
        outer: starts_the_chain as usize,
    };

    let sink = unsafe {
        cr::make_report_sink(|_text: &str| {
            // the presenter has already verified the ordering
            #[allow(clippy::exit)]
            std::process::exit(0);
        })
    };

    let _reporter = cr::CrashReporter::install(
        cr::ReporterConfig::new("mayhem-test", "1.0.0").presenter(Box::new(presenter)),
        Some(sink),
    );

    starts_the_chain();

    panic!("this should be impossible");
}
