//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: `async fn` bodies in the bridge crates MUST NOT block on I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::io` inside async code.
//! Plain functions that run before the runtime starts (config loading, PID
//! file handling) may use `std::fs`.

use architectural_enforcement::{blocking_io_violations, scan};

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = scan(blocking_io_violations);

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O calls found in async code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nForbidden inside async fn:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener");
        eprintln!("  - std::io::stdin()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\nRequired:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::net::TcpListener::bind().await");
        eprintln!("  - tokio::io::stdin() with AsyncBufReadExt");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.",
            violations.len()
        );
    }
}

/// The scan must actually see the production crates
#[test]
fn test_scan_covers_production_crates() {
    let files = architectural_enforcement::production_files();
    assert!(files.iter().any(|p| p.ends_with("session/mod.rs")));
    assert!(files.iter().any(|p| p.ends_with("daemon/src/main.rs")));
}
