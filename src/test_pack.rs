use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::{
    exec::{execute_command, Status},
    test_case::{TestCase, TEST_FILE_EXTENSION},
};

/// A redirect is followed this many levels; deeper redirect targets are taken literally.
const MAX_REDIRECT_DEPTH: usize = 1;

const REDIRECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TestPackError {
    #[error("test not found: {}", .0.join(", "))]
    NotFound(Vec<String>),
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TestPackError + '_ {
    move |source| TestPackError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolves the targets named by the REDIRECTTEST section of a test.
///
/// Targets are test names or directories relative to the test pack root.
pub trait RedirectEvaluator: Sync {
    fn evaluate<'a>(&'a self, test_case: &'a TestCase) -> BoxFuture<'a, Result<Vec<String>, String>>;
}

/// Runs the REDIRECTTEST code with the php binary under test.
pub struct PhpRedirectEvaluator {
    pub php: String,
    pub root: PathBuf,
}

impl PhpRedirectEvaluator {
    fn script(code: &str) -> String {
        let code = code.trim().trim_start_matches("<?php").trim_end_matches("?>");
        format!(
            "$config = (function () {{ {} }})();\n\
             $tests = isset($config['TESTS']) ? (array) $config['TESTS'] : array();\n\
             echo json_encode(array_values($tests));",
            code
        )
    }
}

impl RedirectEvaluator for PhpRedirectEvaluator {
    fn evaluate<'a>(&'a self, test_case: &'a TestCase) -> BoxFuture<'a, Result<Vec<String>, String>> {
        Box::pin(async move {
            let code = test_case
                .section(crate::test_case::Section::RedirectTest)
                .ok_or_else(|| format!("{} is not a redirect test", test_case.name))?;
            let command = vec![
                self.php.clone(),
                "-n".to_string(),
                "-r".to_string(),
                Self::script(code),
            ];

            let output =
                execute_command(&command, "", &[], Some(&self.root), REDIRECT_TIMEOUT).await?;
            if output.status != Status::Exit(0) {
                return Err(format!(
                    "redirect code failed with {:?}: {}",
                    output.status,
                    output.stderr.trim_end()
                ));
            }

            serde_json::from_str::<Vec<String>>(output.stdout.trim())
                .map(|targets| {
                    targets
                        .into_iter()
                        .map(|t| t.trim_start_matches("./").trim_end_matches('/').to_string())
                        .collect()
                })
                .map_err(|err| format!("cannot read redirect targets: {}", err))
        })
    }
}

pub struct TestPackReader<'a> {
    root: PathBuf,
    evaluator: &'a dyn RedirectEvaluator,
    ignore_missing: bool,
}

impl<'a> TestPackReader<'a> {
    pub fn new(root: &Path, evaluator: &'a dyn RedirectEvaluator, ignore_missing: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            evaluator,
            ignore_missing,
        }
    }

    /// Loads the tests selected by `names` (every test when empty), with
    /// redirects resolved, sorted by name.
    pub async fn read(&self, names: &[String]) -> Result<Vec<TestCase>, TestPackError> {
        let all = list_tests(&self.root, "")?;
        let selected = if names.is_empty() {
            all
        } else {
            self.select(&all, names)?
        };

        let mut test_cases = vec![];
        for name in selected {
            let test_case = self.load(&name)?;
            if test_case.is_redirect() {
                test_cases.extend(self.resolve_redirect(&test_case).await?);
            } else {
                test_cases.push(test_case);
            }
        }

        test_cases.sort_by(|a, b| a.name.cmp(&b.name));
        test_cases.dedup_by(|a, b| a.name == b.name && a.redirect_parent == b.redirect_parent);
        Ok(test_cases)
    }

    fn load(&self, name: &str) -> Result<TestCase, TestPackError> {
        TestCase::load(&self.root, name).map_err(io_error(&self.root.join(name)))
    }

    fn select(&self, all: &[String], names: &[String]) -> Result<Vec<String>, TestPackError> {
        let mut selected: Vec<String> = vec![];
        let mut add = |name: &String| {
            if !selected.contains(name) {
                selected.push(name.clone());
            }
        };

        // exact paths first, then directories, then fragments of file names
        let mut fragments = vec![];
        for name in names {
            let relative = name.trim_start_matches("./").trim_end_matches('/');
            if let Some(exact) = all.iter().find(|t| t.as_str() == relative) {
                add(exact);
            } else if !relative.is_empty() && self.root.join(relative).is_dir() {
                let prefix = format!("{}/", relative);
                all.iter().filter(|t| t.starts_with(&prefix)).for_each(&mut add);
            } else {
                fragments.push(name);
            }
        }

        let mut unmatched = vec![];
        for fragment in fragments {
            let lower = fragment.to_lowercase();
            let matched = all
                .iter()
                .filter(|t| file_name(t).to_lowercase().contains(&lower))
                .collect::<Vec<_>>();
            if matched.is_empty() {
                unmatched.push(fragment.clone());
            }
            matched.into_iter().for_each(&mut add);
        }

        if !unmatched.is_empty() {
            if !self.ignore_missing {
                return Err(TestPackError::NotFound(unmatched));
            }
            tracing::warn!(names = ?unmatched, "ignoring names matching no test");
        }
        Ok(selected)
    }

    async fn resolve_redirect(&self, parent: &TestCase) -> Result<Vec<TestCase>, TestPackError> {
        let mut resolved = HashSet::from([parent.name.clone()]);
        let mut worklist = VecDeque::new();
        let mut test_cases = vec![];

        self.enqueue_targets(parent, 1, &mut worklist).await;

        while let Some((target, depth)) = worklist.pop_front() {
            let path = self.root.join(&target);
            if path.is_dir() {
                list_tests(&self.root, &target)?
                    .into_iter()
                    .for_each(|name| worklist.push_back((name, depth)));
                continue;
            }
            if !path.is_file() {
                tracing::warn!(redirect = %parent.name, target = %target, "redirect target does not exist");
                continue;
            }
            if !resolved.insert(target.clone()) {
                tracing::debug!(redirect = %parent.name, target = %target, "redirect target already resolved");
                break;
            }

            let test_case = self.load(&target)?.with_redirect_parent(&parent.name);
            if test_case.is_redirect() && depth < MAX_REDIRECT_DEPTH {
                self.enqueue_targets(&test_case, depth + 1, &mut worklist)
                    .await;
            } else {
                test_cases.push(test_case);
            }
        }

        Ok(test_cases)
    }

    async fn enqueue_targets(
        &self,
        test_case: &TestCase,
        depth: usize,
        worklist: &mut VecDeque<(String, usize)>,
    ) {
        match self.evaluator.evaluate(test_case).await {
            Ok(targets) => targets
                .into_iter()
                .for_each(|target| worklist.push_back((target, depth))),
            Err(err) => {
                tracing::warn!(redirect = %test_case.name, error = %err, "cannot resolve redirect")
            }
        }
    }
}

fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Lists test names under `dir` (relative to `root`, empty for the root), sorted.
fn list_tests(root: &Path, dir: &str) -> Result<Vec<String>, TestPackError> {
    let mut names = vec![];
    let mut dirs = vec![dir.to_string()];

    while let Some(dir) = dirs.pop() {
        let path = root.join(&dir);
        for entry in std::fs::read_dir(&path).map_err(io_error(&path))? {
            let entry = entry.map_err(io_error(&path))?;
            let file_type = entry.file_type().map_err(io_error(&entry.path()))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let name = if dir.is_empty() {
                file_name.clone()
            } else {
                format!("{}/{}", dir, file_name)
            };

            // symlinked directories are not followed
            if file_type.is_dir() {
                dirs.push(name);
            } else if file_name.to_lowercase().ends_with(TEST_FILE_EXTENSION) {
                names.push(name);
            }
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
pub mod testutil {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Returns configured targets per redirect test and records every call.
    #[derive(Default)]
    pub struct StubRedirectEvaluator {
        pub targets: HashMap<String, Vec<String>>,
        pub evaluated: Mutex<Vec<String>>,
    }

    impl StubRedirectEvaluator {
        pub fn new(targets: Vec<(&str, Vec<&str>)>) -> Self {
            Self {
                targets: targets
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl RedirectEvaluator for StubRedirectEvaluator {
        fn evaluate<'a>(
            &'a self,
            test_case: &'a TestCase,
        ) -> BoxFuture<'a, Result<Vec<String>, String>> {
            Box::pin(async move {
                self.evaluated.lock().unwrap().push(test_case.name.clone());
                self.targets
                    .get(&test_case.name)
                    .cloned()
                    .ok_or_else(|| format!("no targets for {}", test_case.name))
            })
        }
    }

    pub const PLAIN: &str = "--TEST--\nplain\n--FILE--\n<?php echo 1;\n--EXPECT--\n1\n";
    pub const REDIRECT: &str = "--TEST--\nredirect\n--REDIRECTTEST--\nreturn array();\n";

    pub fn test_pack(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        files.iter().for_each(|(name, contents)| {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        });
        dir
    }
}
