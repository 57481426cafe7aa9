use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories holding this crate's Rust sources.
const SOURCE_ROOTS: [&str; 6] = ["cli", "prediction", "interp", "shared", "tests", "benches"];

/// One source policy: a line regex plus a filter that decides whether a
/// matching line really breaks the rule.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    is_violation: fn(&str) -> bool,
    hint: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        is_violation: underscore_in_code,
        hint: "Use the binding (dropping the underscore) or remove it.",
    },
    Rule {
        name: "forbidden comment markers",
        pattern: r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        is_violation: always,
        hint: "Comments describe the code as it is, not how it got there. Delete the marker.",
    },
    Rule {
        name: "'**' in non-doc comments",
        pattern: r"(//|/\*).*\*\*",
        is_violation: outside_doc_comment,
        hint: "Emphasis markup belongs in `///` doc comments only.",
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*|///).*",
        is_violation: comment_is_all_caps,
        hint: "Rewrite the comment in sentence case or delete it.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        is_violation: always,
        hint: "Use the code or remove it.",
    },
];

/// Gathers `line:text` for every match the rule's filter accepts.
struct LineCollector {
    is_violation: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.is_violation)(line) {
            self.violations.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

fn always(_: &str) -> bool {
    true
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// Text between an odd number of quotes counts as a string literal.
fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn outside_doc_comment(line: &str) -> bool {
    !line.trim_start().starts_with("///")
}

fn comment_is_all_caps(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(start) = line.find("/*") {
        let body = &line[start + 2..];
        body.find("*/").map_or(body, |end| &body[..end])
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    stamp_build_time();

    if let Err(e) = enforce_source_policy() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

// Exposes the build time to `brainage version`.
fn stamp_build_time() {
    let seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=BRAINAGE_BUILD_TIMESTAMP={seconds}");
}

// Every readable `.rs` file below the source roots.
fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .filter(|path| std::fs::read_to_string(path).is_ok())
        .collect()
}

fn enforce_source_policy() -> Result<(), Box<dyn Error>> {
    let sources = rust_sources();
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in &sources {
            let mut collector = LineCollector {
                is_violation: rule.is_violation,
                violations: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut collector)?;
            if !collector.violations.is_empty() {
                return Err(report(rule, path, &collector.violations).into());
            }
        }
    }
    Ok(())
}

fn report(rule: &Rule, path: &Path, violations: &[String]) -> String {
    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.name,
        path.display()
    );
    for violation in violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {} These are not allowed in this project.\n", rule.hint));
    message
}
