mod shared;

use shared::{Expected, Mayhem};

#[test]
fn handles_stack_overflow() {
    shared::reports_crash(
        Mayhem::StackOverflow,
        Expected {
            description_contains: "Caught SIGSEGV",
            // no stack margin to walk, so exactly the faulting address
            min_frames: 1,
            exact_frames: Some(1),
            ..Default::default()
        },
    );
}
