use std::time::Duration;

use reqwest::Client;

use super::{judge, missing_file_section, skip_redirect, skip_reason};
use crate::{
    sapi::SapiInstance,
    test_case::{Section, TestCase, TestResult, TestStatus},
};

/// Runs tests by requesting their scripts from a SAPI instance.
pub struct HttpRunner {
    client: Client,
    timeout: Duration,
}

impl HttpRunner {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("cannot create HTTP client: {}", err))?;
        Ok(Self { client, timeout })
    }

    pub async fn run(&self, test_case: &TestCase, instance: &dyn SapiInstance) -> TestResult {
        if let Some(skipped) = skip_redirect(test_case) {
            return skipped;
        }

        if let Some(code) = test_case.section(Section::SkipIf) {
            match self
                .request(test_case, instance, &test_case.skipif_script_name(), code)
                .await
            {
                Ok(body) => {
                    if let Some(reason) = skip_reason(&body) {
                        return TestResult::new(test_case, TestStatus::Skip).with_message(reason);
                    }
                }
                Err(result) => return result,
            }
        }

        let Some(code) = test_case.section(Section::File) else {
            return missing_file_section(test_case);
        };
        let result = match self
            .request(test_case, instance, &test_case.script_name(), code)
            .await
        {
            Ok(body) => TestResult {
                stdout: body.clone(),
                ..judge(test_case, &body)
            },
            Err(result) => result,
        };

        if let Some(code) = test_case.section(Section::Clean) {
            let name = format!("{}.clean.php", test_case.script_name().trim_end_matches(".php"));
            if let Err(result) = self.request(test_case, instance, &name, code).await {
                tracing::warn!(test = %test_case.name, "CLEAN section failed: {:?}", result.messages);
            }
        }

        result
    }

    /// Publishes `code` as `name` under the docroot and fetches it.
    async fn request(
        &self,
        test_case: &TestCase,
        instance: &dyn SapiInstance,
        name: &str,
        code: &str,
    ) -> Result<String, TestResult> {
        let fail = |status: TestStatus, message: String| {
            TestResult::new(test_case, status).with_message(message)
        };

        let path = instance.docroot().join(name);
        std::fs::write(&path, code).map_err(|err| {
            fail(
                TestStatus::Fail,
                format!("cannot write {}: {}", path.display(), err),
            )
        })?;

        let url = format!("http://{}/{}", instance.address(), name);
        tracing::trace!(url = %url, "requesting test script");
        let response = self.client.get(&url).send().await;
        let body = match response {
            Ok(response) => response
                .text()
                .await
                .map_err(|err| fail(TestStatus::Fail, format!("cannot read {}: {}", url, err))),
            Err(err) if err.is_timeout() => Err(fail(
                TestStatus::Timeout,
                format!("timed out after {:?}", self.timeout),
            )),
            Err(err) => Err(self.connection_failure(test_case, instance, &url, err).await),
        };

        if let Err(err) = std::fs::remove_file(&path) {
            tracing::debug!(script = %path.display(), "cannot remove script: {}", err);
        }
        body
    }

    async fn connection_failure(
        &self,
        test_case: &TestCase,
        instance: &dyn SapiInstance,
        url: &str,
        err: reqwest::Error,
    ) -> TestResult {
        if instance.is_running().await {
            return TestResult::new(test_case, TestStatus::Fail)
                .with_message(format!("request to {} failed: {}", url, err));
        }

        instance.mark_crashed();
        tracing::warn!(test = %test_case.name, address = %instance.address(), "SAPI instance crashed");
        TestResult {
            sapi_output: instance.sapi_output(),
            ..TestResult::new(test_case, TestStatus::Crash).with_message(format!(
                "SAPI instance at {} is not running: {}",
                instance.address(),
                err
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        group_key::TestCaseGroupKey,
        ini::PhpIni,
        sapi::{testutil::StubInstance, InstanceState},
        test_pack::testutil::test_pack,
    };
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use pretty_assertions::assert_eq;

    fn instance(address: &str, docroot: &Path, state: InstanceState) -> StubInstance {
        StubInstance {
            id: 0,
            key: TestCaseGroupKey {
                ini: Arc::new(PhpIni::new()),
                env: BTreeMap::new(),
            },
            address: address.to_string(),
            state: Mutex::new(state),
            docroot: docroot.to_path_buf(),
            closed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    mod run {
        use super::*;

        #[tokio::test]
        async fn compares_response_body() {
            let server = Server::run();
            server.expect(
                Expectation::matching(request::method_path("GET", "/dir/a.php"))
                    .respond_with(status_code(200).body("1\n")),
            );
            let pack = test_pack(&[("dir/a.phpt", "--FILE--\n<?php echo 1;\n--EXPECT--\n1\n")]);
            let tc = TestCase::load(pack.path(), "dir/a.phpt").unwrap();
            let instance = instance(&server.addr().to_string(), pack.path(), InstanceState::Running);

            let result = HttpRunner::new(Duration::from_secs(5))
                .unwrap()
                .run(&tc, &instance)
                .await;

            assert_eq!(TestStatus::Pass, result.status);
            assert_eq!("1\n", result.stdout);
            assert!(!pack.path().join("dir/a.php").exists());
        }

        #[tokio::test]
        async fn skipif_is_requested_first() {
            let server = Server::run();
            server.expect(
                Expectation::matching(request::method_path("GET", "/a.skip.php"))
                    .respond_with(status_code(200).body("skip no ext")),
            );
            let pack = test_pack(&[(
                "a.phpt",
                "--SKIPIF--\n<?php echo 'skip no ext';\n--FILE--\nx\n--EXPECT--\n1\n",
            )]);
            let tc = TestCase::load(pack.path(), "a.phpt").unwrap();
            let instance = instance(&server.addr().to_string(), pack.path(), InstanceState::Running);

            let result = HttpRunner::new(Duration::from_secs(5))
                .unwrap()
                .run(&tc, &instance)
                .await;

            assert_eq!(TestStatus::Skip, result.status);
            assert_eq!(vec!["skip no ext".to_string()], result.messages);
        }

        #[tokio::test]
        async fn slow_response_times_out() {
            let server = Server::run();
            server.expect(
                Expectation::matching(request::method_path("GET", "/a.php"))
                    .respond_with(delay_and_then(Duration::from_secs(2), status_code(200))),
            );
            let pack = test_pack(&[("a.phpt", "--FILE--\nx\n--EXPECT--\n1\n")]);
            let tc = TestCase::load(pack.path(), "a.phpt").unwrap();
            let instance = instance(&server.addr().to_string(), pack.path(), InstanceState::Running);

            let result = HttpRunner::new(Duration::from_millis(200))
                .unwrap()
                .run(&tc, &instance)
                .await;

            assert_eq!(TestStatus::Timeout, result.status);
        }

        #[tokio::test]
        async fn refused_connection_of_dead_instance_is_crash() {
            let pack = test_pack(&[("a.phpt", "--FILE--\nx\n--EXPECT--\n1\n")]);
            let tc = TestCase::load(pack.path(), "a.phpt").unwrap();
            let instance = instance(&free_address(), pack.path(), InstanceState::Crashed);

            let result = HttpRunner::new(Duration::from_secs(5))
                .unwrap()
                .run(&tc, &instance)
                .await;

            assert_eq!(TestStatus::Crash, result.status);
            assert_eq!(Some("log of instance 0".to_string()), result.sapi_output);
        }

        #[tokio::test]
        async fn refused_connection_of_live_instance_is_failure() {
            let pack = test_pack(&[("a.phpt", "--FILE--\nx\n--EXPECT--\n1\n")]);
            let tc = TestCase::load(pack.path(), "a.phpt").unwrap();
            let instance = instance(&free_address(), pack.path(), InstanceState::Running);

            let result = HttpRunner::new(Duration::from_secs(5))
                .unwrap()
                .run(&tc, &instance)
                .await;

            assert_eq!(TestStatus::Fail, result.status);
            assert_eq!(None, result.sapi_output);
        }
    }
}
