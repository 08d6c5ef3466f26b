use std::path::Path;
use std::time::Duration;

use super::{judge, missing_file_section, skip_redirect, skip_reason};
use crate::{
    exec::{display_command, execute_command, Output, Status},
    group_key::TestCaseGroupKey,
    test_case::{Section, TestCase, TestResult, TestStatus},
};

/// Runs every test in its own `php` process.
pub struct CliRunner {
    php: String,
    timeout: Duration,
}

impl CliRunner {
    pub fn new(php: &str, timeout: Duration) -> Self {
        Self {
            php: php.to_string(),
            timeout,
        }
    }

    fn command(&self, key: &TestCaseGroupKey, script: &Path, args: &[String]) -> Vec<String> {
        let mut command = vec![self.php.clone(), "-n".to_string()];
        command.extend(key.ini.to_cli_args());
        command.push(script.display().to_string());
        command.extend(args.iter().cloned());
        command
    }

    pub async fn run(&self, test_case: &TestCase, key: &TestCaseGroupKey) -> TestResult {
        if let Some(skipped) = skip_redirect(test_case) {
            return skipped;
        }

        if let Some(code) = test_case.section(Section::SkipIf) {
            let script = test_case.path.with_extension("skip.php");
            match self.execute(test_case, key, &script, code, "", &[]).await {
                Ok(output) => {
                    if let Some(reason) = skip_reason(&output.stdout) {
                        return TestResult::new(test_case, TestStatus::Skip).with_message(reason);
                    }
                }
                Err(result) => return result,
            }
        }

        let Some(code) = test_case.section(Section::File) else {
            return missing_file_section(test_case);
        };
        let script = test_case.path.with_extension("php");
        let stdin = test_case.section(Section::Stdin).unwrap_or("");
        let result = match self
            .execute(test_case, key, &script, code, stdin, &test_case.args())
            .await
        {
            Ok(output) => TestResult {
                stdout: output.stdout.clone(),
                stderr: output.stderr,
                ..judge(test_case, &output.stdout)
            },
            Err(result) => result,
        };

        if let Some(code) = test_case.section(Section::Clean) {
            let script = test_case.path.with_extension("clean.php");
            if let Err(result) = self.execute(test_case, key, &script, code, "", &[]).await {
                tracing::warn!(test = %test_case.name, "CLEAN section failed: {:?}", result.messages);
            }
        }

        result
    }

    /// Writes `code` to `script` and runs it; abnormal ends are returned as results.
    async fn execute(
        &self,
        test_case: &TestCase,
        key: &TestCaseGroupKey,
        script: &Path,
        code: &str,
        stdin: &str,
        args: &[String],
    ) -> Result<Output, TestResult> {
        let fail = |status: TestStatus, message: String| {
            TestResult::new(test_case, status).with_message(message)
        };

        std::fs::write(script, code).map_err(|err| {
            fail(
                TestStatus::Fail,
                format!("cannot write {}: {}", script.display(), err),
            )
        })?;

        let command = self.command(key, script, args);
        tracing::trace!(command = %display_command(&command), "running test script");
        let output = execute_command(
            &command,
            stdin,
            &key.env_pairs(),
            script.parent(),
            self.timeout,
        )
        .await;
        if let Err(err) = std::fs::remove_file(script) {
            tracing::debug!(script = %script.display(), "cannot remove script: {}", err);
        }

        let output = output.map_err(|err| fail(TestStatus::Fail, err))?;
        match output.status {
            Status::Exit(_) => Ok(output),
            Status::Timeout => Err(TestResult {
                stdout: output.stdout,
                stderr: output.stderr,
                ..fail(
                    TestStatus::Timeout,
                    format!("timed out after {:?}", self.timeout),
                )
            }),
            Status::Signal(signal) => Err(TestResult {
                stdout: output.stdout,
                stderr: output.stderr,
                ..fail(TestStatus::Crash, format!("terminated by signal {}", signal))
            }),
        }
    }
}
