mod shared;

use shared::{Expected, Mayhem};

#[test]
fn handles_divide_by_zero() {
    shared::reports_crash(
        Mayhem::DivideByZero,
        Expected {
            description_contains: "Caught SIGFPE",
            // the raiser plus the helper that called it, at minimum
            min_frames: 2,
            ..Default::default()
        },
    );
}
