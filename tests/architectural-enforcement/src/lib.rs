//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce the gateway's
//! threading rules by scanning source files:
//! - Blocking calls (`reqwest::blocking`, `std::thread::sleep`,
//!   `blocking_send`) live only on the worker side: the model runtimes and
//!   the streaming bridge
//! - Event-loop code never performs blocking file or network I/O inside an
//!   `async fn`
//!
//! Shared scanning helpers live here; the checks are in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories of the gateway, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// Files (or directories, with a trailing `/`) that run on worker threads
///
/// Paths are relative to the workspace root.
pub const WORKER_SIDE: &[&str] = &["gateway/core/src/runtime/", "gateway/core/src/inference/bridge.rs"];

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// One scanned Rust file
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root, `/`-separated
    pub relative: String,
    /// Production lines: everything before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Whether this file runs on worker threads
    pub fn is_worker_side(&self) -> bool {
        WORKER_SIDE.iter().any(|allowed| {
            if allowed.ends_with('/') {
                self.relative.starts_with(allowed)
            } else {
                self.relative == *allowed
            }
        })
    }

    /// Production lines with `//` comments stripped, paired with 1-based line numbers
    pub fn code_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx + 1, strip_comment(line)))
    }

    /// Whether the function enclosing line `line_number` is `async`
    pub fn in_async_fn(&self, line_number: usize) -> bool {
        let refs: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        enclosing_fn_is_async(&refs, line_number.saturating_sub(1))
    }
}

/// Load every `.rs` file under the production directories
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.exists(), "missing source directory {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push(SourceFile {
                relative,
                lines: production_part(&content),
            });
        }
    }
    files
}

/// Lines preceding the first `#[cfg(test)]`
pub fn production_part(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .map(str::to_string)
        .collect()
}

/// Drop a trailing `//` comment (including doc comments)
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Scan backwards for the nearest `fn` and report whether it is `async`
pub fn enclosing_fn_is_async(lines: &[&str], current_idx: usize) -> bool {
    if lines.is_empty() {
        return false;
    }
    for i in (0..=current_idx.min(lines.len() - 1)).rev() {
        let line = strip_comment(lines[i]).trim();

        if line.contains("async fn ") || line.contains("async move") {
            return true;
        }
        if line.starts_with("fn ")
            || line.starts_with("pub fn ")
            || line.starts_with("pub(crate) fn ")
            || line.contains(" fn ")
        {
            return false;
        }
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_detection() {
        let code = [
            "async fn bad() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(enclosing_fn_is_async(&code, 1));
    }

    #[test]
    fn test_sync_detection() {
        let code = [
            "pub fn load() -> Result<(), Error> {",
            "    let contents = std::fs::read_to_string(\"gateway.toml\")?;",
            "}",
        ];
        assert!(!enclosing_fn_is_async(&code, 1));
    }

    #[test]
    fn test_spawned_block_counts_as_async() {
        let code = [
            "fn start() {",
            "    tokio::spawn(async move {",
            "        std::thread::sleep(d);",
            "    });",
            "}",
        ];
        assert!(enclosing_fn_is_async(&code, 2));
    }

    #[test]
    fn test_production_part_stops_at_test_module() {
        let content = "fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        assert_eq!(production_part(content), vec!["fn a() {}".to_string(), String::new()]);
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1; // std::thread::sleep"), "let x = 1; ");
        assert_eq!(strip_comment("/// std::thread::sleep"), "");
    }

    #[test]
    fn test_worker_side_paths() {
        let file = |relative: &str| SourceFile {
            relative: relative.to_string(),
            lines: Vec::new(),
        };
        assert!(file("gateway/core/src/runtime/ollama.rs").is_worker_side());
        assert!(file("gateway/core/src/inference/bridge.rs").is_worker_side());
        assert!(!file("gateway/core/src/inference/admission.rs").is_worker_side());
        assert!(!file("gateway/daemon/src/server.rs").is_worker_side());
    }
}
