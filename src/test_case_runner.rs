use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::runtime::Handle;

use crate::{
    config::{Config, HookKind},
    group_key::{group_key_for, Baseline, TestCaseGroupKey},
    host::Host,
    instance_manager::{Acquired, SharedInstanceManager},
    permutation::PermutationLayer,
    reporter::Reporter,
    runner::{CliRunner, HttpRunner},
    sapi::{self, lock, CrashReport},
    scenario_set::ScenarioSet,
    test_case::{TestCase, TestResult, TestResultSummary, TestStatus},
    test_pack::{PhpRedirectEvaluator, TestPackError, TestPackReader},
};

pub struct RunOptions {
    pub test_pack: PathBuf,
    /// Explicit test names or fragments; every test when empty.
    pub names: Vec<String>,
    pub layer: PermutationLayer,
    pub ignore_missing: bool,
    pub threads: Option<usize>,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    TestPack(#[from] TestPackError),
    #[error("cannot prepare scenario set {set}: {message}")]
    Setup { set: String, message: String },
    #[error("cannot report: {0}")]
    Report(String),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub summary: TestResultSummary,
    /// Scenario sets skipped because their setup failed.
    pub failed_sets: Vec<String>,
}

/// Splits tests into batches sharing a group key, keeping first-seen order.
pub fn group_test_cases(
    test_cases: Vec<TestCase>,
    baseline: &Baseline,
) -> IndexMap<TestCaseGroupKey, Vec<(usize, TestCase)>> {
    let mut groups: IndexMap<TestCaseGroupKey, Vec<(usize, TestCase)>> = IndexMap::new();
    let mut current: Option<TestCaseGroupKey> = None;

    for (i, test_case) in test_cases.into_iter().enumerate() {
        let key = group_key_for(&test_case, current.as_ref(), baseline);
        groups.entry(key.clone()).or_default().push((i, test_case));
        current = Some(key);
    }
    groups
}

pub fn run_tests<W: Write + Send>(
    config: &Config,
    options: &RunOptions,
    reporter: &mut Reporter<W>,
    stop: &AtomicBool,
    runtime: &Handle,
) -> Result<RunSummary, Error> {
    reporter.on_run_start().map_err(Error::Report)?;

    let mut outcome = RunSummary::default();
    let sets = config.get_scenario_sets(options.layer);
    {
        let reporter = Mutex::new(&mut *reporter);
        'hosts: for host in &config.hosts {
            for set in sets.iter() {
                if stop.load(Ordering::SeqCst) {
                    tracing::warn!("run interrupted");
                    break 'hosts;
                }

                let set_runner = ScenarioSetRunner {
                    config,
                    options,
                    host,
                    set,
                    reporter: &reporter,
                    stop,
                };
                match set_runner.run(runtime) {
                    Ok(results) => outcome.summary.results.extend(results),
                    Err(err @ Error::Setup { .. }) => {
                        tracing::error!(host = %host.name, "{}", err);
                        outcome.failed_sets.push(set.name());
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    reporter.on_run_end(&outcome.summary).map_err(Error::Report)?;

    Ok(outcome)
}

struct ScenarioSetRunner<'a, 'r, 'w, W: Write> {
    config: &'a Config,
    options: &'a RunOptions,
    host: &'a Host,
    set: &'a ScenarioSet,
    reporter: &'a Mutex<&'r mut Reporter<'w, W>>,
    stop: &'a AtomicBool,
}

impl<'a, 'r, 'w, W: Write + Send> ScenarioSetRunner<'a, 'r, 'w, W> {
    fn setup_error<S: ToString>(&self, message: S) -> Error {
        Error::Setup {
            set: self.set.name(),
            message: message.to_string(),
        }
    }

    fn run(&self, runtime: &Handle) -> Result<Vec<TestResult>, Error> {
        let baseline = Baseline::new(self.set, &self.config.ini, &self.config.env, self.host);
        let env = baseline.key().env_pairs();

        let results = self.setup_and_run(runtime, &baseline, &env);

        for scenario in self.set.scenarios().iter().rev() {
            if let Err(err) = runtime.block_on(scenario.teardown(&env)) {
                tracing::warn!(scenario = %scenario.name, "{}", err);
            }
        }
        results
    }

    fn setup_and_run(
        &self,
        runtime: &Handle,
        baseline: &Baseline,
        env: &[(String, String)],
    ) -> Result<Vec<TestResult>, Error> {
        let test_pack = &self.options.test_pack;

        for scenario in self.set.scenarios() {
            runtime
                .block_on(scenario.setup(env))
                .map_err(|err| self.setup_error(err))?;
        }
        let manager = sapi::new_manager(&self.set.sapi(), self.host, test_pack);
        if let Some(manager) = &manager {
            runtime
                .block_on(manager.setup())
                .map_err(|err| self.setup_error(err))?;
            tracing::debug!(
                sapi = %manager.name(),
                docroot = %manager.default_docroot().display(),
                ssl = manager.is_ssl_supported(),
                "web server manager is ready"
            );
        }

        runtime.block_on(self.config.process_test_pack(test_pack, self.set));
        let evaluator = PhpRedirectEvaluator {
            php: self.host.php.clone(),
            root: test_pack.clone(),
        };
        let reader = TestPackReader::new(test_pack, &evaluator, self.options.ignore_missing);
        let test_cases = runtime.block_on(reader.read(&self.options.names))?;
        if self.config.has_hooks(HookKind::ProcessTestCase) {
            for test_case in &test_cases {
                runtime.block_on(self.config.process_test_case(test_pack, self.set, test_case));
            }
        }

        lock(self.reporter)
            .on_scenario_set_start(self.host, self.set, test_cases.len())
            .map_err(Error::Report)?;
        tracing::info!(
            host = %self.host.name,
            scenario_set = %self.set.name(),
            tests = test_cases.len(),
            "running scenario set"
        );

        let (keys, jobs) = queue_jobs(group_test_cases(test_cases, baseline));
        // a manager without concurrent instances would serialize every worker anyway
        let threads = match &manager {
            Some(manager) if !manager.allow_concurrent_instances() => 1,
            _ => self
                .options
                .threads
                .unwrap_or_else(|| self.set.sapi().threads())
                .clamp(1, jobs.len().max(1)),
        };
        tracing::debug!(groups = keys.len(), threads, "dispatching test cases");

        let worker = Worker {
            cli: CliRunner::new(&self.host.php, self.options.timeout),
            http: HttpRunner::new(self.options.timeout).map_err(|err| self.setup_error(err))?,
            instances: manager.map(|m| SharedInstanceManager::new(m, threads)),
            keys,
            failed_groups: Mutex::new(HashMap::new()),
            host: self.host.name.clone(),
            set: self.set.name(),
            reporter: self.reporter,
            stop: self.stop,
            results: Mutex::new(vec![]),
            report_error: Mutex::new(None),
        };
        worker.dispatch(jobs, threads, runtime)
    }
}

/// One queued test case. `group` indexes the group keys of its scenario set.
struct Job {
    group: usize,
    index: usize,
    test_case: TestCase,
}

/// Flattens groups into a queue of single tests, keeping group order.
fn queue_jobs(
    groups: IndexMap<TestCaseGroupKey, Vec<(usize, TestCase)>>,
) -> (Vec<TestCaseGroupKey>, VecDeque<Job>) {
    let mut keys = Vec::with_capacity(groups.len());
    let mut jobs = VecDeque::new();
    for (group, (key, tests)) in groups.into_iter().enumerate() {
        keys.push(key);
        jobs.extend(tests.into_iter().map(|(index, test_case)| Job {
            group,
            index,
            test_case,
        }));
    }
    (keys, jobs)
}

/// State shared by the worker threads of one scenario set.
struct Worker<'a, 'r, 'w, W: Write> {
    cli: CliRunner,
    http: HttpRunner,
    instances: Option<SharedInstanceManager>,
    keys: Vec<TestCaseGroupKey>,
    /// Groups whose instance failed to start; their remaining tests are not retried.
    failed_groups: Mutex<HashMap<usize, CrashReport>>,
    host: String,
    set: String,
    reporter: &'a Mutex<&'r mut Reporter<'w, W>>,
    stop: &'a AtomicBool,
    results: Mutex<Vec<(usize, TestResult)>>,
    report_error: Mutex<Option<String>>,
}

impl<'a, 'r, 'w, W: Write + Send> Worker<'a, 'r, 'w, W> {
    /// Runs `jobs` on `threads` workers, each pulling one test at a time, and
    /// returns the results in test pack order.
    fn dispatch(
        &self,
        jobs: VecDeque<Job>,
        threads: usize,
        runtime: &Handle,
    ) -> Result<Vec<TestResult>, Error> {
        let queue = Mutex::new(jobs);

        std::thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| loop {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(job) = lock(&queue).pop_front() else {
                        break;
                    };
                    runtime.block_on(self.run(job));
                });
            }
        });

        if let Some(instances) = &self.instances {
            runtime.block_on(instances.release_all());
        }
        if let Some(err) = lock(&self.report_error).take() {
            return Err(Error::Report(err));
        }

        let mut results = std::mem::take(&mut *lock(&self.results));
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    async fn run(&self, job: Job) {
        let Job {
            group,
            index,
            test_case,
        } = job;
        let key = &self.keys[group];
        tracing::debug!(test = %test_case.name, title = test_case.title(), "running test case");

        let Some(instances) = &self.instances else {
            self.record(index, self.cli.run(&test_case, key).await);
            return;
        };

        let failed = lock(&self.failed_groups).get(&group).cloned();
        if let Some(report) = failed {
            self.record(index, crash_result(&test_case, &report));
            return;
        }

        let lease = match instances.acquire(key).await {
            Acquired::Ready(lease) => lease,
            Acquired::Crashed(report) => {
                lock(&self.failed_groups)
                    .entry(group)
                    .or_insert_with(|| report.clone());
                self.record(index, crash_result(&test_case, &report));
                return;
            }
        };

        let result = self.http.run(&test_case, lease.instance()).await;
        if result.status == TestStatus::Timeout {
            // the process may still be busy with the abandoned request
            lease.instance().retire();
        }
        drop(lease);
        self.record(index, result);
    }

    fn record(&self, i: usize, result: TestResult) {
        let result = TestResult {
            host: self.host.clone(),
            scenario_set: self.set.clone(),
            ..result
        };

        if let Err(err) = lock(self.reporter).on_test_case_end(&result) {
            lock(&self.report_error).get_or_insert(err);
        }
        lock(&self.results).push((i, result));
    }
}

fn crash_result(test_case: &TestCase, report: &CrashReport) -> TestResult {
    TestResult {
        sapi_output: report.sapi_output.clone(),
        ..TestResult::new(test_case, TestStatus::Crash)
            .with_message(format!("SAPI instance failed to start: {}", report.message))
    }
}
