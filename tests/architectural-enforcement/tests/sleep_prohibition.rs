//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the bridge crates MUST NOT call sleep.
//! Waiting happens on I/O, `tokio::time::timeout`, deadlines, or
//! `tokio::time::interval` for periodic work.

use architectural_enforcement::{scan, sleep_violations};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(sleep_violations);

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable alternatives:");
        eprintln!("  - tokio::time::timeout / timeout_at around the awaited I/O");
        eprintln!("  - tokio::time::interval for periodic tasks");
        eprintln!("  - Notify or channels to wait for events");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
