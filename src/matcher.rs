mod eq;
mod format;
mod match_regex;

use eq::EqMatcher;
use format::FormatMatcher;
use match_regex::RegexMatcher;

/// Compares the output of a test run with its expectation section.
#[derive(Debug, PartialEq)]
pub enum OutputMatcher {
    Eq(EqMatcher),
    Format(FormatMatcher),
    Regex(RegexMatcher),
}

impl OutputMatcher {
    pub fn new_eq(expected: &str) -> Self {
        OutputMatcher::Eq(EqMatcher::new(expected))
    }

    pub fn new_format(expected: &str) -> Result<Self, String> {
        FormatMatcher::new(expected).map(OutputMatcher::Format)
    }

    pub fn new_regex(expected: &str) -> Result<Self, String> {
        RegexMatcher::new(expected).map(OutputMatcher::Regex)
    }

    /// Returns whether `actual` satisfies the expectation and, if not, why.
    pub fn matches(&self, actual: &str) -> (bool, String) {
        let actual = normalize(actual);
        match self {
            OutputMatcher::Eq(m) => m.matches(&actual),
            OutputMatcher::Format(m) => m.matches(&actual),
            OutputMatcher::Regex(m) => m.matches(&actual),
        }
    }
}

pub(crate) fn normalize(s: &str) -> String {
    s.replace("\r\n", "\n").trim().to_string()
}
