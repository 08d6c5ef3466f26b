use once_cell::sync::Lazy;
use regex::Regex;

use super::match_regex::RegexMatcher;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)%r(.*?)%r|%[eEsSaAwidxfc]").unwrap());

/// Matches EXPECTF sections, where `%`-placeholders stand for classes of text.
#[derive(Debug, PartialEq)]
pub struct FormatMatcher {
    inner: RegexMatcher,
}

impl FormatMatcher {
    pub fn new(expected: &str) -> Result<Self, String> {
        RegexMatcher::from_anchored(format!("(?s)^{}$", to_pattern(&super::normalize(expected))))
            .map(|inner| Self { inner })
    }

    pub fn matches(&self, actual: &str) -> (bool, String) {
        self.inner.matches(actual)
    }
}

fn to_pattern(format: &str) -> String {
    let mut pattern = String::with_capacity(format.len() * 2);
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(format) {
        let Some(m) = caps.get(0) else {
            continue;
        };
        pattern.push_str(&regex::escape(&format[last..m.start()]));
        if let Some(raw) = caps.get(1) {
            pattern.push_str(&format!("(?:{})", raw.as_str()));
        } else {
            pattern.push_str(match m.as_str() {
                "%e" | "%E" => "/",
                "%s" => r"[^\r\n]+",
                "%S" => r"[^\r\n]*",
                "%a" => r".+",
                "%A" => r".*",
                "%w" => r"\s*",
                "%i" => r"[+-]?\d+",
                "%d" => r"\d+",
                "%x" => r"[0-9a-fA-F]+",
                "%f" => r"[+-]?\.?\d+\.?\d*(?:[Ee][+-]?\d+)?",
                _ => r".",
            });
        }
        last = m.end();
    }
    pattern.push_str(&regex::escape(&format[last..]));
    pattern
}
