use similar::TextDiff;

use super::normalize;

#[derive(Debug, PartialEq)]
pub struct EqMatcher {
    expected: String,
}

impl EqMatcher {
    pub fn new(expected: &str) -> Self {
        Self {
            expected: normalize(expected),
        }
    }

    pub fn matches(&self, actual: &str) -> (bool, String) {
        if actual == self.expected {
            (true, format!("should not be \"{}\", but got it", actual))
        } else {
            let diff_message = TextDiff::from_lines(self.expected.as_str(), actual)
                .iter_all_changes()
                .map(|change| {
                    let tag = match change.tag() {
                        similar::ChangeTag::Delete => "-",
                        similar::ChangeTag::Insert => "+",
                        similar::ChangeTag::Equal => " ",
                    };
                    let line = change.to_string();
                    if line.ends_with('\n') {
                        format!("{}{}", tag, line)
                    } else {
                        format!("{}{}\n", tag, line)
                    }
                })
                .collect::<Vec<_>>()
                .join("");

            (false, format!("output not equals:\n\n{}", diff_message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("hello", true, "should not be \"hello\", but got it")]
    #[case("goodbye", false, "output not equals:\n\n-hello\n+goodbye\n")]
    fn matches(
        #[case] given: &str,
        #[case] expected_matched: bool,
        #[case] expected_message: &str,
    ) {
        let m = EqMatcher::new("hello\n");
        assert_eq!(
            (expected_matched, expected_message.to_string()),
            m.matches(given),
        );
    }
}
