use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::webdriver::DriverKind;

/// Flags that classify a module as a known crasher. Entries carrying any other
/// flag are excluded from the run entirely.
const CRASH_FLAGS: &[&str] = &["crash", "crash-chrome", "crash-firefox"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub flags: Vec<String>,
}

impl TestCase {
    /// Whether this module is pre-classified as failing on `kind`.
    pub fn expected_failure(&self, kind: DriverKind) -> bool {
        let browser_flag = format!("crash-{}", kind.name());
        self.flags
            .iter()
            .any(|flag| flag == "crash" || *flag == browser_flag)
    }
}

/// Loads a flat manifest: one module name per line, optionally followed by
/// whitespace-separated flag tokens. `#` comments and blank lines are skipped.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<TestCase>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    Ok(parse_manifest(&contents))
}

fn parse_manifest(contents: &str) -> Vec<TestCase> {
    let mut cases = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut tokens = trimmed.split_whitespace().map(str::to_string);
        let name = match tokens.next() {
            Some(name) => name,
            None => continue,
        };
        cases.push(TestCase {
            name,
            flags: tokens.collect(),
        });
    }
    cases
}

/// Selects the cases to execute: those with no flags, or with at least one
/// flag from the crash-classification set. Everything else is dropped without
/// being reported.
pub fn selected(cases: &[TestCase]) -> Vec<TestCase> {
    cases
        .iter()
        .filter(|case| {
            case.flags.is_empty()
                || case
                    .flags
                    .iter()
                    .any(|flag| CRASH_FLAGS.contains(&flag.as_str()))
        })
        .cloned()
        .collect()
}
