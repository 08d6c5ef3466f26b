use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{host::Host, ini::PhpIni, scenario_set::ScenarioSet, test_case::TestCase};

/// Effective configuration a shared SAPI instance must have to run a test.
///
/// Keys are compared by value; two keys are equal only when both the ini
/// directives and the environment are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCaseGroupKey {
    pub ini: Arc<PhpIni>,
    pub env: BTreeMap<String, String>,
}

impl TestCaseGroupKey {
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Configuration shared by every test of one scenario set on one host.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub ini: Arc<PhpIni>,
    pub env: BTreeMap<String, String>,
}

impl Baseline {
    pub fn new(
        set: &ScenarioSet,
        ini_overrides: &PhpIni,
        env_overrides: &BTreeMap<String, String>,
        host: &Host,
    ) -> Self {
        let mut ini = PhpIni::new_baseline();
        ini.replace_all(&set.ini());
        ini.replace_all(ini_overrides);

        let mut env = set.env();
        env.extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("TEST_PHP_EXECUTABLE".to_string(), host.php.clone());
        env.insert("TEST_PHP_CGI_EXECUTABLE".to_string(), host.php_cgi());

        Self {
            ini: Arc::new(ini.mark_default()),
            env,
        }
    }

    pub fn key(&self) -> TestCaseGroupKey {
        TestCaseGroupKey {
            ini: self.ini.clone(),
            env: self.env.clone(),
        }
    }
}

/// Computes the key `test_case` must run under, given the key of the
/// previous test in the same batch.
pub fn group_key_for(
    test_case: &TestCase,
    current: Option<&TestCaseGroupKey>,
    baseline: &Baseline,
) -> TestCaseGroupKey {
    let test_ini = test_case.ini();
    let test_env = test_case.env();

    if test_ini.is_none() && test_env.is_none() {
        if let Some(current) = current {
            // a default ini is only reusable when no earlier test changed the env
            if current.ini.is_default() && current.env == baseline.env {
                return current.clone();
            }
        }
    }

    let ini = match test_ini {
        Some(test_ini) => {
            let mut ini = baseline.ini.as_ref().clone();
            ini.replace_all(&test_ini);
            Arc::new(ini)
        }
        None => baseline.ini.clone(),
    };

    let mut env = baseline.env.clone();
    if let Some(test_env) = test_env {
        env.extend(test_env);
    }

    TestCaseGroupKey { ini, env }
}
