//! Architectural Enforcement
//!
//! Source scans run as integration tests against the production crates:
//! - No sleep calls in production code (wait on I/O, timers or intervals)
//! - No blocking `std::fs` / `std::net` I/O inside `async fn` bodies
//!
//! The scans are line-based. Everything from the first `#[cfg(test)]` line
//! of a file onward is treated as test code, which matches the convention of
//! keeping the test module at the bottom of each file.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: [&str; 2] = ["bridge/core/src", "bridge/daemon/src"];

/// A forbidden construct found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the construct
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What rule was broken
    pub rule: &'static str,
    /// The offending source line, trimmed
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.source
        )
    }
}

/// Workspace root, two levels above this crate's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .map(walkdir::DirEntry::into_path)
        })
        .collect()
}

/// Strip a trailing `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Index of the first `#[cfg(test)]` line, or the line count
#[must_use]
pub fn production_end(lines: &[&str]) -> usize {
    lines
        .iter()
        .position(|l| l.trim_start().starts_with("#[cfg(test)]"))
        .unwrap_or(lines.len())
}

fn indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Whether `line` declares a function, and if so whether it is async
#[must_use]
pub fn fn_declaration(line: &str) -> Option<bool> {
    let mut rest = line.trim_start();
    loop {
        let stripped = ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe ", "extern \"C\" "]
            .iter()
            .find_map(|prefix| rest.strip_prefix(prefix));
        match stripped {
            Some(next) => rest = next,
            None => break,
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Whether line `idx` sits inside an `async fn` body
///
/// The enclosing function is the nearest preceding declaration indented
/// less than the line itself.
#[must_use]
pub fn in_async_fn(lines: &[&str], idx: usize) -> bool {
    let depth = indent(lines[idx]);
    for line in lines[..idx].iter().rev() {
        if line.trim().is_empty() || indent(line) >= depth {
            continue;
        }
        if let Some(is_async) = fn_declaration(line) {
            return is_async;
        }
    }
    false
}

/// Sleep calls outside test code
#[must_use]
pub fn sleep_violations(path: &Path, content: &str) -> Vec<Violation> {
    let lines: Vec<&str> = content.lines().collect();
    let end = production_end(&lines);
    lines[..end]
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            let code = code_part(line);
            code.contains("thread::sleep") || code.contains("time::sleep")
        })
        .map(|(idx, line)| Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            rule: "Sleep in production code",
            source: line.trim().to_string(),
        })
        .collect()
}

/// Blocking file or network I/O inside async function bodies
#[must_use]
pub fn blocking_io_violations(path: &Path, content: &str) -> Vec<Violation> {
    let lines: Vec<&str> = content.lines().collect();
    let end = production_end(&lines);
    let fs_imported = lines[..end]
        .iter()
        .any(|l| code_part(l).trim() == "use std::fs;");

    let mut violations = Vec::new();
    for (idx, line) in lines[..end].iter().enumerate() {
        let code = code_part(line);
        let rule = if code.contains("std::fs::") && !code.contains("Permissions") {
            "Blocking file I/O"
        } else if fs_imported && code.contains("fs::") && !code.contains("tokio::fs::") {
            "Blocking file I/O"
        } else if ["std::net::TcpStream", "std::net::TcpListener", "std::net::UdpSocket"]
            .iter()
            .any(|p| code.contains(p))
        {
            "Blocking network I/O"
        } else if code.contains("std::io::stdin()") {
            "Blocking stdin"
        } else if code.contains("reqwest::blocking") {
            "Blocking HTTP client"
        } else {
            continue;
        };
        if in_async_fn(&lines, idx) {
            violations.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                rule,
                source: line.trim().to_string(),
            });
        }
    }
    violations
}

/// Run `check` over every production file
#[must_use]
pub fn scan(check: fn(&Path, &str) -> Vec<Violation>) -> Vec<Violation> {
    production_files()
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok().map(|c| check(path, &c)))
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_declaration() {
        assert_eq!(fn_declaration("    pub async fn run(self) {"), Some(true));
        assert_eq!(fn_declaration("pub(crate) fn new() -> Self {"), Some(false));
        assert_eq!(fn_declaration("    let f = async move {"), None);
    }

    #[test]
    fn test_async_body_detection() {
        let code = [
            "impl Foo {",
            "    async fn bad(&self) {",
            "        let contents = std::fs::read_to_string(\"file.txt\");",
            "    }",
            "    fn fine(&self) {",
            "        let contents = std::fs::read_to_string(\"file.txt\");",
            "    }",
            "}",
        ];
        assert!(in_async_fn(&code, 2));
        assert!(!in_async_fn(&code, 5));

        let violations = blocking_io_violations(Path::new("x.rs"), &code.join("\n"));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 3);
    }

    #[test]
    fn test_test_module_is_skipped() {
        let code = "fn main() {}\n#[cfg(test)]\nmod tests {\n    async fn t() { tokio::time::sleep(d).await; }\n}";
        assert!(sleep_violations(Path::new("x.rs"), code).is_empty());
    }

    #[test]
    fn test_sleep_detected() {
        let code = "async fn poll() {\n    tokio::time::sleep(d).await; \n}";
        let violations = sleep_violations(Path::new("x.rs"), code);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Sleep in production code");
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).exists(), "missing {dir}");
        }
    }
}
