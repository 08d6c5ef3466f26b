use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;

use crate::{ini::PhpIni, matcher::OutputMatcher};

pub const TEST_FILE_EXTENSION: &str = ".phpt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Test,
    File,
    Expect,
    ExpectF,
    ExpectRegex,
    SkipIf,
    Ini,
    Env,
    Args,
    Stdin,
    Clean,
    RedirectTest,
    XFail,
}

impl Section {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TEST" => Some(Section::Test),
            "FILE" => Some(Section::File),
            "EXPECT" => Some(Section::Expect),
            "EXPECTF" => Some(Section::ExpectF),
            "EXPECTREGEX" => Some(Section::ExpectRegex),
            "SKIPIF" => Some(Section::SkipIf),
            "INI" => Some(Section::Ini),
            "ENV" => Some(Section::Env),
            "ARGS" => Some(Section::Args),
            "STDIN" => Some(Section::Stdin),
            "CLEAN" => Some(Section::Clean),
            "REDIRECTTEST" => Some(Section::RedirectTest),
            "XFAIL" => Some(Section::XFail),
            _ => None,
        }
    }
}

/// A single test definition file, split into its sections.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Path relative to the test pack root, always `/`-separated.
    pub name: String,
    pub path: PathBuf,
    pub sections: IndexMap<Section, String>,
    /// Name of the redirect test this case was loaded for, if any.
    pub redirect_parent: Option<String>,
}

impl TestCase {
    pub fn parse(name: &str, path: &Path, contents: &str) -> Self {
        let mut sections = IndexMap::new();
        // unknown sections leave `current` empty, so their bodies are dropped
        let mut current: Option<(Section, String)> = None;

        for line in contents.split_inclusive('\n') {
            let header = line
                .trim_end()
                .strip_prefix("--")
                .and_then(|rest| rest.strip_suffix("--"))
                .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_uppercase() || c == '_'));

            if let Some(header) = header {
                if let Some((section, body)) = current.take() {
                    sections.insert(section, body);
                }
                current = Section::from_name(header).map(|section| (section, String::new()));
            } else if let Some((_, body)) = current.as_mut() {
                body.push_str(line);
            }
        }
        if let Some((section, body)) = current.take() {
            sections.insert(section, body);
        }

        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            sections,
            redirect_parent: None,
        }
    }

    pub fn load(root: &Path, name: &str) -> std::io::Result<Self> {
        let path = root.join(name);
        let contents = std::fs::read(&path)?;
        Ok(Self::parse(
            name,
            &path,
            &String::from_utf8_lossy(&contents),
        ))
    }

    pub fn with_redirect_parent(mut self, parent: &str) -> Self {
        self.redirect_parent = Some(parent.to_string());
        self
    }

    pub fn contains(&self, section: Section) -> bool {
        self.sections.contains_key(&section)
    }

    pub fn section(&self, section: Section) -> Option<&str> {
        self.sections.get(&section).map(String::as_str)
    }

    pub fn is_redirect(&self) -> bool {
        self.contains(Section::RedirectTest)
    }

    pub fn title(&self) -> &str {
        self.section(Section::Test).map(str::trim).unwrap_or("")
    }

    /// INI directives the test declares, if it has an INI section.
    pub fn ini(&self) -> Option<PhpIni> {
        self.section(Section::Ini).map(PhpIni::parse)
    }

    /// Environment variables the test declares, if it has an ENV section.
    pub fn env(&self) -> Option<BTreeMap<String, String>> {
        self.section(Section::Env).map(|body| {
            body.lines()
                .filter_map(|line| line.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim_end().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .collect()
        })
    }

    pub fn args(&self) -> Vec<String> {
        self.section(Section::Args)
            .map(|args| args.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn expectation(&self) -> Result<OutputMatcher, String> {
        if let Some(expected) = self.section(Section::Expect) {
            Ok(OutputMatcher::new_eq(expected))
        } else if let Some(expected) = self.section(Section::ExpectF) {
            OutputMatcher::new_format(expected)
        } else if let Some(expected) = self.section(Section::ExpectRegex) {
            OutputMatcher::new_regex(expected)
        } else {
            Err("test has no EXPECT, EXPECTF or EXPECTREGEX section".to_string())
        }
    }

    /// Name of the script generated from the FILE section, next to the test.
    pub fn script_name(&self) -> String {
        format!(
            "{}.php",
            self.name
                .strip_suffix(TEST_FILE_EXTENSION)
                .unwrap_or(&self.name)
        )
    }

    pub fn skipif_script_name(&self) -> String {
        format!(
            "{}.skip.php",
            self.name
                .strip_suffix(TEST_FILE_EXTENSION)
                .unwrap_or(&self.name)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    XFail,
    Skip,
    Crash,
    Timeout,
}

impl TestStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestStatus::Pass | TestStatus::XFail | TestStatus::Skip)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    /// Redirect test that pulled this test in; `None` when run directly.
    pub redirect_parent: Option<String>,
    pub host: String,
    pub scenario_set: String,
    pub status: TestStatus,
    pub messages: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Diagnostic log of the SAPI instance the test ran against, for crashes.
    pub sapi_output: Option<String>,
}

impl TestResult {
    pub fn new(test_case: &TestCase, status: TestStatus) -> Self {
        Self {
            name: test_case.name.clone(),
            redirect_parent: test_case.redirect_parent.clone(),
            host: String::new(),
            scenario_set: String::new(),
            status,
            messages: vec![],
            stdout: String::new(),
            stderr: String::new(),
            sapi_output: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status.is_passed()
    }
}

#[derive(Debug, PartialEq, Default)]
pub struct TestResultSummary {
    pub results: Vec<TestResult>,
}

impl TestResultSummary {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn classified_results(&self) -> (Vec<&TestResult>, Vec<&TestResult>) {
        let mut passed = vec![];
        let mut failed = vec![];

        for tr in &self.results {
            if tr.is_passed() {
                passed.push(tr);
            } else {
                failed.push(tr);
            }
        }

        (passed, failed)
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn is_all_passed(&self) -> bool {
        self.results.iter().all(|result| result.is_passed())
    }
}
