mod shared;

use shared::{Expected, Mayhem};

#[test]
fn handles_null_write() {
    shared::reports_crash(
        Mayhem::NullWrite,
        Expected {
            description_contains: "Caught SIGSEGV",
            ..Default::default()
        },
    );
}
