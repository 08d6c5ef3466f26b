mod cli;
mod http;

use crate::test_case::{Section, TestCase, TestResult, TestStatus};

pub use cli::CliRunner;
pub use http::HttpRunner;

/// Decides the status of a test from the output of its FILE section.
pub fn judge(test_case: &TestCase, output: &str) -> TestResult {
    let matcher = match test_case.expectation() {
        Ok(matcher) => matcher,
        Err(err) => return TestResult::new(test_case, TestStatus::Fail).with_message(err),
    };

    let (matched, diff) = matcher.matches(output);
    if matched {
        TestResult::new(test_case, TestStatus::Pass)
    } else if let Some(reason) = test_case.section(Section::XFail) {
        TestResult::new(test_case, TestStatus::XFail)
            .with_message(format!("expected failure: {}", reason.trim()))
    } else {
        TestResult::new(test_case, TestStatus::Fail).with_message(diff)
    }
}

/// Reason to skip a test when its SKIPIF output starts with "skip".
pub fn skip_reason(output: &str) -> Option<String> {
    let output = output.trim();
    output
        .get(..4)
        .filter(|prefix| prefix.eq_ignore_ascii_case("skip"))
        .map(|_| output.to_string())
}

/// Redirect tests only stand for the tests they point at.
fn skip_redirect(test_case: &TestCase) -> Option<TestResult> {
    test_case.is_redirect().then(|| {
        TestResult::new(test_case, TestStatus::Skip).with_message("redirect test is not run directly")
    })
}

fn missing_file_section(test_case: &TestCase) -> TestResult {
    TestResult::new(test_case, TestStatus::Fail).with_message("test has no FILE section")
}
