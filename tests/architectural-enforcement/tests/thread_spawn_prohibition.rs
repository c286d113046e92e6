//! Integration Test: OS Thread Ownership
//!
//! **Policy**: Only the streaming bridge starts OS threads. Everything else
//! runs as tokio tasks, and blocking setup work goes through
//! `tokio::task::spawn_blocking`.

use architectural_enforcement::production_sources;

const BRIDGE: &str = "gateway/core/src/inference/bridge.rs";

#[test]
fn test_only_the_bridge_spawns_threads() {
    let mut violations = Vec::new();
    for file in production_sources() {
        if file.relative == BRIDGE {
            continue;
        }
        for (line_number, code) in file.code_lines() {
            if code.contains("thread::spawn(") || code.contains("thread::Builder") {
                violations.push(format!("{}:{} - {}", file.relative, line_number, code.trim()));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "OS threads started outside the bridge:\n{}",
        violations.join("\n")
    );
}

#[test]
fn test_bridge_names_its_worker_threads() {
    let bridge = production_sources()
        .into_iter()
        .find(|f| f.relative == BRIDGE)
        .expect("bridge source present");
    assert!(bridge
        .code_lines()
        .any(|(_, code)| code.contains("thread::Builder::new()")));
    assert!(bridge.code_lines().any(|(_, code)| code.contains(".name(")));
}
