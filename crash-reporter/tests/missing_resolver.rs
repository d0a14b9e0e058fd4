mod shared;

use shared::{Expected, Mayhem};

/// A resolver that cannot even be spawned must not cost us any frames; every
/// frame falls back to its raw trace text.
#[test]
fn reports_without_a_working_resolver() {
    shared::reports_crash_with(
        Mayhem::NullWrite,
        Expected {
            description_contains: "Caught SIGSEGV",
            all_locations_present: cfg!(all(unix, not(target_os = "macos"))),
            ..Default::default()
        },
        |config| config.resolver("/nonexistent/definitely-not-a-resolver"),
    );
}
