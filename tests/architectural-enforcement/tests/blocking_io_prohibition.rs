//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Event-loop code MUST NOT block a runtime thread. Blocking model
//! calls happen on dedicated worker threads, and only the model runtimes and
//! the streaming bridge may use blocking primitives.
//!
//! **Required in async code**: `tokio::fs`, `tokio::net`, `tokio::time::sleep`,
//! `tokio::task::spawn_blocking` for unavoidable blocking work.

use architectural_enforcement::{production_sources, SourceFile};

/// Blocking primitives only the worker side may touch
const WORKER_ONLY: &[(&str, &str)] = &[
    ("reqwest::blocking", "Blocking HTTP client"),
    ("thread::sleep", "Thread sleep"),
    ("blocking_send(", "Blocking channel send"),
    ("blocking_recv(", "Blocking channel receive"),
    (".block_on(", "Nested runtime block_on"),
];

/// Blocking I/O that is fine before the runtime starts, never inside `async`
const SYNC_ONLY: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
];

fn report(violations: &[String], headline: &str) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {headline}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!("\n✅ Worker-side files (may block):");
    for allowed in architectural_enforcement::WORKER_SIDE {
        eprintln!("  - {allowed}");
    }
    panic!("\nFound {} violation(s). Fix these before merging!", violations.len());
}

fn scan(files: &[SourceFile], patterns: &[(&str, &str)], applies: impl Fn(&SourceFile, usize) -> bool) -> Vec<String> {
    let mut violations = Vec::new();
    for file in files {
        for (line_number, code) in file.code_lines() {
            for (pattern, label) in patterns {
                if code.contains(pattern) && applies(file, line_number) {
                    violations.push(format!(
                        "{}:{} - {}: {}",
                        file.relative,
                        line_number,
                        label,
                        code.trim()
                    ));
                }
            }
        }
    }
    violations
}

#[test]
fn test_blocking_primitives_stay_on_worker_side() {
    let files = production_sources();
    let violations = scan(&files, WORKER_ONLY, |file, _| !file.is_worker_side());
    report(&violations, "Blocking primitives found outside the worker side!");
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let files = production_sources();
    let violations = scan(&files, SYNC_ONLY, |file, line| {
        !file.is_worker_side() && file.in_async_fn(line)
    });
    report(&violations, "Blocking I/O found inside async code!");
}

#[test]
fn test_worker_side_is_where_blocking_happens() {
    // Guards against the scanner silently matching nothing
    let files = production_sources();
    let uses = |relative: &str, pattern: &str| {
        files
            .iter()
            .filter(|f| f.relative == relative)
            .any(|f| f.code_lines().any(|(_, code)| code.contains(pattern)))
    };

    assert!(uses("gateway/core/src/inference/bridge.rs", "blocking_send("));
    assert!(uses("gateway/core/src/runtime/ollama.rs", "reqwest::blocking"));
    assert!(uses("gateway/core/src/runtime/scripted.rs", "thread::sleep"));
}
