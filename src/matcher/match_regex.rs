use regex::Regex;

#[derive(Debug)]
pub struct RegexMatcher {
    expected: Regex,
}

impl PartialEq for RegexMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.expected.as_str() == other.expected.as_str()
    }
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, String> {
        Self::from_anchored(format!("(?s)^(?:{})$", super::normalize(pattern)))
    }

    pub(super) fn from_anchored(pattern: String) -> Result<Self, String> {
        Regex::new(&pattern)
            .map(|expected| Self { expected })
            .map_err(|err| format!("invalid expectation pattern: {}", err))
    }

    pub fn matches(&self, actual: &str) -> (bool, String) {
        if self.expected.is_match(actual) {
            (
                true,
                format!("should not match to /{}/, but match to it", self.expected),
            )
        } else {
            (
                false,
                format!(
                    "should match to /{}/, but don't match to it:\n\n{}",
                    self.expected, actual
                ),
            )
        }
    }
}
