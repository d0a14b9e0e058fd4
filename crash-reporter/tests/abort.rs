mod shared;

use shared::{Expected, Mayhem};

#[test]
fn handles_abort() {
    shared::reports_crash(
        Mayhem::Abort,
        Expected {
            description_contains: "Caught SIGABRT",
            ..Default::default()
        },
    );
}
