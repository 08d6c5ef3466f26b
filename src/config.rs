use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use saphyr::Yaml;

use crate::{
    ast::Map,
    exec::{display_command, execute_command, Status},
    host::Host,
    ini::PhpIni,
    permutation::{exclude, permute, PermutationLayer},
    sapi::lock,
    scenario::{ApacheSapi, SapiKind, Scenario, ScenarioFamily, WebSapi},
    scenario_set::ScenarioSet,
    test_case::TestCase,
    validator::{Validator, Violation},
};

const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(PartialEq, Debug)]
pub struct Error {
    pub filename: String,
    pub message: String,
    pub violations: Vec<Violation>,
}

impl Error {
    pub fn without_violations<S: AsRef<str>>(filename: S, message: String) -> Self {
        Self {
            filename: filename.as_ref().to_string(),
            message,
            violations: vec![],
        }
    }

    fn with_violations<S: AsRef<str>>(filename: S, message: String, violations: Vec<Violation>) -> Self {
        Self {
            filename: filename.as_ref().to_string(),
            message,
            violations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Runs once per host and scenario set before the test list is read.
    ProcessTestPack,
    /// Runs once per loaded test case.
    ProcessTestCase,
}

impl HookKind {
    const ALL: [HookKind; 2] = [HookKind::ProcessTestPack, HookKind::ProcessTestCase];

    pub fn name(&self) -> &'static str {
        match self {
            HookKind::ProcessTestPack => "process_test_pack",
            HookKind::ProcessTestCase => "process_test_case",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hook {
    pub filename: String,
    pub kind: HookKind,
    pub command: Vec<String>,
}

impl Hook {
    async fn run(&self, env: &[(String, String)]) -> Result<(), String> {
        tracing::debug!(hook = self.kind.name(), command = %display_command(&self.command), "running hook");
        let output = execute_command(&self.command, "", env, None, HOOK_TIMEOUT).await?;
        match output.status {
            Status::Exit(0) => Ok(()),
            status => Err(format!("{:?}: {}", status, output.stderr.trim_end())),
        }
    }
}

/// The contents of one configuration file.
///
/// Scenario set members stay names until every file is merged, so sets may
/// refer to scenarios from other files.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigFile {
    pub filename: String,
    pub hosts: Vec<Host>,
    pub scenarios: Vec<Scenario>,
    /// Path of each set in the file, with its member names.
    pub scenario_sets: Vec<(String, Vec<String>)>,
    pub not_scenarios: Vec<String>,
    pub ini: PhpIni,
    pub env: BTreeMap<String, String>,
    pub hooks: Vec<Hook>,
}

pub fn parse(filename: &str, mut reader: impl std::io::Read) -> Result<ConfigFile, Error> {
    let mut source = String::new();
    reader
        .read_to_string(&mut source)
        .map_err(|err| Error::without_violations(filename, format!("cannot read: {}", err)))?;
    let docs = Yaml::load_from_str(&source)
        .map_err(|err| Error::without_violations(filename, format!("cannot parse: {}", err)))?;

    let empty = ConfigFile {
        filename: filename.to_string(),
        ..Default::default()
    };
    let ast = match docs.into_iter().next() {
        None | Some(Yaml::Null) => return Ok(empty),
        Some(ast) => ast,
    };

    let mut v = Validator::new(filename);
    let file = v.must_be_map(&ast).map(|root| ConfigFile {
        hosts: v
            .may_have_seq(&root, "hosts", |v, hosts| v.map_seq(hosts, parse_host))
            .flatten()
            .unwrap_or_default(),
        scenarios: v
            .may_have_seq(&root, "scenarios", |v, scenarios| {
                v.map_seq(scenarios, parse_scenario)
            })
            .flatten()
            .unwrap_or_default(),
        scenario_sets: v
            .may_have_seq(&root, "scenario_sets", |v, sets| {
                v.map_seq(sets, |v, set| {
                    v.must_be_seq(set)
                        .and_then(|names| v.map_seq(names, |v, name| v.must_be_string(name)))
                        .map(|names| (v.current_path(), names))
                })
            })
            .flatten()
            .unwrap_or_default(),
        not_scenarios: v
            .may_have_seq(&root, "not_scenarios", |v, fragments| {
                v.map_seq(fragments, |v, fragment| v.must_be_string(fragment))
            })
            .flatten()
            .unwrap_or_default(),
        ini: v.may_have_map(&root, "ini", parse_ini).unwrap_or_default(),
        env: v.may_have_map(&root, "env", parse_env).unwrap_or_default(),
        hooks: v
            .may_have_map(&root, "hooks", |v, hooks| {
                HookKind::ALL
                    .into_iter()
                    .filter_map(|kind| {
                        v.may_have_command(hooks, kind.name()).map(|command| Hook {
                            filename: filename.to_string(),
                            kind,
                            command,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default(),
        ..empty
    });

    match file {
        Some(file) if v.violations.is_empty() => Ok(file),
        _ => Err(Error::with_violations(
            filename,
            "invalid configuration".to_string(),
            v.violations,
        )),
    }
}

fn parse_host(v: &mut Validator, x: &Yaml) -> Option<Host> {
    let m = v.must_be_map(x)?;
    let name = v.must_have_string(&m, "name");
    let php = v.may_have_string(&m, "php");
    let tmp_dir = v.may_have_string(&m, "tmp_dir").map(PathBuf::from);

    Some(Host {
        name: name?,
        php: php.unwrap_or_else(|| Host::default().php),
        tmp_dir,
    })
}

fn parse_scenario(v: &mut Validator, x: &Yaml) -> Option<Scenario> {
    let m = v.must_be_map(x)?;
    let name = v.must_have_string(&m, "name");
    let family = v.must_have_string(&m, "family").and_then(|family| {
        let parsed = ScenarioFamily::from_name(&family);
        if parsed.is_none() {
            v.in_field("family", |v| {
                v.add_violation(format!("unknown scenario family \"{}\"", family))
            });
        }
        parsed
    });
    let critical = v.may_have_bool(&m, "critical").unwrap_or(false);
    let ini = v.may_have_map(&m, "ini", parse_ini).unwrap_or_default();
    let env = v.may_have_map(&m, "env", parse_env).unwrap_or_default();
    let setup = v.may_have_command(&m, "setup");
    let teardown = v.may_have_command(&m, "teardown");
    let sapi = match family {
        Some(ScenarioFamily::Sapi) => Some(parse_sapi(v, &m)?),
        _ => None,
    };

    Some(Scenario {
        name: name?,
        family: family?,
        critical,
        ini,
        env,
        setup,
        teardown,
        sapi,
    })
}

fn parse_sapi(v: &mut Validator, m: &Map) -> Option<SapiKind> {
    let defaults = WebSapi::default();
    let port = match v.may_have_uint(m, "port") {
        Some(port) => u16::try_from(port).ok().or_else(|| {
            v.in_field("port", |v| v.add_violation("should be a port number"));
            None
        })?,
        None => defaults.port,
    };
    let web = WebSapi {
        port,
        threads: v
            .may_have_uint(m, "threads")
            .map(|n| (n as usize).max(1))
            .unwrap_or(defaults.threads),
        start_timeout: v
            .may_have_duration(m, "start_timeout")
            .unwrap_or(defaults.start_timeout),
    };

    match v.may_have_string(m, "sapi").as_deref().unwrap_or("cli") {
        "cli" => Some(SapiKind::Cli),
        "builtin_web" => Some(SapiKind::BuiltinWeb(web)),
        "apache" => {
            let httpd = v.may_have_string(m, "httpd").unwrap_or_else(|| "httpd".to_string());
            let module = v.must_have_string(m, "module")?;
            Some(SapiKind::Apache(ApacheSapi {
                web,
                httpd: PathBuf::from(httpd),
                module: PathBuf::from(module),
            }))
        }
        other => {
            v.in_field("sapi", |v| v.add_violation(format!("unknown sapi \"{}\"", other)));
            None
        }
    }
}

/// Directive values may be a scalar or a list of scalars for repeated names.
fn parse_ini(v: &mut Validator, m: &Map) -> PhpIni {
    let mut ini = PhpIni::new();
    for (&name, &value) in m.iter() {
        v.in_field(name, |v| match value {
            Yaml::Array(values) => {
                if let Some(values) = v.map_seq(values, |v, x| v.must_be_scalar(x)) {
                    values.iter().for_each(|x| ini.put_multiple(name, x));
                }
            }
            _ => {
                if let Some(x) = v.must_be_scalar(value) {
                    ini.put_single(name, x);
                }
            }
        });
    }
    ini
}

fn parse_env(v: &mut Validator, m: &Map) -> BTreeMap<String, String> {
    m.iter()
        .filter_map(|(&name, &value)| {
            v.in_field(name, |v| v.must_be_scalar(value))
                .map(|value| (name.to_string(), value))
        })
        .collect()
}

/// Merged configuration of a run.
#[derive(Debug, Default)]
pub struct Config {
    pub hosts: Vec<Host>,
    pub scenarios: Vec<Arc<Scenario>>,
    pub scenario_sets: Vec<ScenarioSet>,
    pub not_scenarios: Vec<String>,
    pub ini: PhpIni,
    pub env: BTreeMap<String, String>,
    pub hooks: Vec<Hook>,
    permutations: Mutex<HashMap<PermutationLayer, Arc<Vec<ScenarioSet>>>>,
}

impl Config {
    /// Merges files in order; hosts and scenarios defined twice keep the first definition.
    pub fn merge(files: Vec<ConfigFile>) -> Result<Self, Vec<Error>> {
        let mut config = Config::default();
        let mut pending_sets = vec![];

        for file in files {
            for host in file.hosts {
                if !config.hosts.iter().any(|h| h.name == host.name) {
                    config.hosts.push(host);
                }
            }
            for scenario in file.scenarios {
                if !config.scenarios.iter().any(|s| s.name == scenario.name) {
                    config.scenarios.push(Arc::new(scenario));
                }
            }
            for fragment in file.not_scenarios {
                if !config.not_scenarios.contains(&fragment) {
                    config.not_scenarios.push(fragment);
                }
            }
            config.ini.replace_all(&file.ini);
            config.env.extend(file.env);
            config.hooks.extend(file.hooks);
            pending_sets.extend(
                file.scenario_sets
                    .into_iter()
                    .map(|(path, names)| (file.filename.clone(), path, names)),
            );
        }

        let mut errs = vec![];
        for (filename, path, names) in pending_sets {
            let (members, unknown): (Vec<_>, Vec<_>) = names
                .iter()
                .map(|name| config.scenarios.iter().find(|s| &s.name == name).ok_or(name))
                .partition(Result::is_ok);

            if unknown.is_empty() {
                config
                    .scenario_sets
                    .push(ScenarioSet::new(members.into_iter().flatten().cloned()));
            } else {
                let violations = unknown
                    .into_iter()
                    .filter_map(Result::err)
                    .map(|name| Violation {
                        filename: filename.clone(),
                        path: path.clone(),
                        message: format!("unknown scenario \"{}\"", name),
                    })
                    .collect();
                errs.push(Error::with_violations(
                    &filename,
                    "invalid scenario set".to_string(),
                    violations,
                ));
            }
        }
        if !errs.is_empty() {
            return Err(errs);
        }

        if config.hosts.is_empty() {
            config.hosts.push(Host::default());
        }
        tracing::info!(
            "Loaded {} hosts: {}",
            config.hosts.len(),
            config.hosts.iter().map(|h| h.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(config)
    }

    /// Scenario sets to run for `layer`, computed once per layer.
    pub fn get_scenario_sets(&self, layer: PermutationLayer) -> Arc<Vec<ScenarioSet>> {
        lock(&self.permutations)
            .entry(layer)
            .or_insert_with(|| {
                let sets = exclude(
                    &self.not_scenarios,
                    permute(layer, &self.scenarios, &self.scenario_sets),
                );
                tracing::info!(
                    ?layer,
                    "Loaded {} scenario sets: {}",
                    sets.len(),
                    sets.iter().map(ScenarioSet::name).collect::<Vec<_>>().join(", ")
                );
                Arc::new(sets)
            })
            .clone()
    }

    pub async fn process_test_pack(&self, test_pack: &Path, set: &ScenarioSet) {
        let env = hook_env(test_pack, set);
        self.run_hooks(HookKind::ProcessTestPack, &env).await;
    }

    pub async fn process_test_case(&self, test_pack: &Path, set: &ScenarioSet, test_case: &TestCase) {
        let mut env = hook_env(test_pack, set);
        env.push(("SAPIRUN_TEST_NAME".to_string(), test_case.name.clone()));
        self.run_hooks(HookKind::ProcessTestCase, &env).await;
    }

    async fn run_hooks(&self, kind: HookKind, env: &[(String, String)]) {
        for hook in self.hooks.iter().filter(|hook| hook.kind == kind) {
            if let Err(err) = hook.run(env).await {
                tracing::warn!(filename = %hook.filename, hook = kind.name(), "hook failed: {}", err);
            }
        }
    }

    pub fn has_hooks(&self, kind: HookKind) -> bool {
        self.hooks.iter().any(|hook| hook.kind == kind)
    }
}

fn hook_env(test_pack: &Path, set: &ScenarioSet) -> Vec<(String, String)> {
    vec![
        ("SAPIRUN_TEST_PACK".to_string(), test_pack.display().to_string()),
        ("SAPIRUN_SCENARIO_SET".to_string(), set.name()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::testutil::plain_test;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const FILENAME: &str = "sapirun.yaml";

    fn violation(path: &str, message: &str) -> Violation {
        Violation {
            filename: FILENAME.to_string(),
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    fn merged(sources: &[(&str, &str)]) -> Result<Config, Vec<Error>> {
        Config::merge(
            sources
                .iter()
                .map(|(filename, source)| parse(filename, source.as_bytes()).unwrap())
                .collect(),
        )
    }

    mod parse {
        use super::*;

        #[test]
        fn full_configuration() {
            let source = r#"
hosts:
  - name: local
    php: /usr/bin/php
    tmp_dir: /var/tmp
scenarios:
  - name: mysql
    family: database
    ini: { extension: [pdo, pdo_mysql], precision: 10 }
    env: { PDO_MYSQL_TEST_DSN: "mysql:host=127.0.0.1" }
    setup: [bash, -c, "true"]
  - name: builtin-www
    family: sapi
    sapi: builtin_web
    port: 41000
    threads: 2
    start_timeout: 3s
  - name: apache
    family: sapi
    sapi: apache
    module: /usr/lib/apache2/modules/libphp.so
scenario_sets:
  - [mysql, builtin-www]
not_scenarios: [postgres]
ini: { display_errors: "1" }
env: { TZ: UTC }
hooks:
  process_test_case: [bash, -c, "true"]
"#;

            let file = parse(FILENAME, source.as_bytes()).unwrap();

            assert_eq!(
                vec![Host {
                    name: "local".to_string(),
                    php: "/usr/bin/php".to_string(),
                    tmp_dir: Some(PathBuf::from("/var/tmp")),
                }],
                file.hosts
            );
            let mysql = &file.scenarios[0];
            assert_eq!(ScenarioFamily::Database, mysql.family);
            assert_eq!(
                Some(&["pdo".to_string(), "pdo_mysql".to_string()][..]),
                mysql.ini.get("extension")
            );
            assert_eq!(Some(&["10".to_string()][..]), mysql.ini.get("precision"));
            assert_eq!(Some(&"mysql:host=127.0.0.1".to_string()), mysql.env.get("PDO_MYSQL_TEST_DSN"));
            assert_eq!(None, mysql.sapi);
            assert_eq!(
                Some(SapiKind::BuiltinWeb(WebSapi {
                    port: 41000,
                    threads: 2,
                    start_timeout: Duration::from_secs(3),
                })),
                file.scenarios[1].sapi
            );
            assert_eq!(
                Some(SapiKind::Apache(ApacheSapi {
                    web: WebSapi::default(),
                    httpd: PathBuf::from("httpd"),
                    module: PathBuf::from("/usr/lib/apache2/modules/libphp.so"),
                })),
                file.scenarios[2].sapi
            );
            assert_eq!(
                vec![(
                    "$.scenario_sets[0]".to_string(),
                    vec!["mysql".to_string(), "builtin-www".to_string()]
                )],
                file.scenario_sets
            );
            assert_eq!(vec!["postgres".to_string()], file.not_scenarios);
            assert_eq!(PhpIni::parse("display_errors=1"), file.ini);
            assert_eq!(Some(&"UTC".to_string()), file.env.get("TZ"));
            assert_eq!(
                vec![Hook {
                    filename: FILENAME.to_string(),
                    kind: HookKind::ProcessTestCase,
                    command: vec!["bash".to_string(), "-c".to_string(), "true".to_string()],
                }],
                file.hooks
            );
        }

        #[rstest]
        #[case("")]
        #[case("---\n")]
        fn empty_file(#[case] source: &str) {
            assert_eq!(
                Ok(ConfigFile {
                    filename: FILENAME.to_string(),
                    ..Default::default()
                }),
                parse(FILENAME, source.as_bytes())
            );
        }

        #[rstest]
        #[case("[]", vec![violation("$", "should be map, but is seq")])]
        #[case("hosts: [{php: php}]", vec![violation("$.hosts[0]", "should have .name as string")])]
        #[case(
            "scenarios: [{name: x, family: gpu}]",
            vec![violation("$.scenarios[0].family", "unknown scenario family \"gpu\"")]
        )]
        #[case(
            "scenarios: [{name: x, family: sapi, sapi: iis}]",
            vec![violation("$.scenarios[0].sapi", "unknown sapi \"iis\"")]
        )]
        #[case(
            "scenarios: [{name: x, family: sapi, sapi: apache}]",
            vec![violation("$.scenarios[0]", "should have .module as string")]
        )]
        #[case(
            "scenarios: [{name: x, family: sapi, sapi: builtin_web, port: 70000}]",
            vec![violation("$.scenarios[0].port", "should be a port number")]
        )]
        #[case(
            "scenarios: [{name: x, family: os, env: {A: [1]}}]",
            vec![violation("$.scenarios[0].env.A", "should be scalar, but is seq")]
        )]
        #[case("scenario_sets: [mysql]", vec![violation("$.scenario_sets[0]", "should be seq, but is string")])]
        #[case("hooks: {process_test_pack: []}", vec![violation("$.hooks.process_test_pack", "should not be empty")])]
        fn violations(#[case] source: &str, #[case] expected: Vec<Violation>) {
            assert_eq!(
                Err(Error {
                    filename: FILENAME.to_string(),
                    message: "invalid configuration".to_string(),
                    violations: expected,
                }),
                parse(FILENAME, source.as_bytes())
            );
        }

        #[test]
        fn syntax_error() {
            let actual = parse(FILENAME, "hosts: [".as_bytes());

            assert!(actual.unwrap_err().message.starts_with("cannot parse: "));
        }
    }

    mod merge {
        use super::*;

        #[test]
        fn first_definition_wins() {
            let config = merged(&[
                (
                    "a.yaml",
                    "scenarios: [{name: mysql, family: database, env: {DSN: a}}]\nenv: {TZ: UTC, A: a}",
                ),
                (
                    "b.yaml",
                    "scenarios: [{name: mysql, family: database, env: {DSN: b}}, {name: pgsql, family: database}]\nscenario_sets: [[mysql, pgsql]]\nenv: {A: b}",
                ),
            ])
            .unwrap();

            assert_eq!(
                vec!["mysql", "pgsql"],
                config.scenarios.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
            );
            assert_eq!(Some(&"a".to_string()), config.scenarios[0].env.get("DSN"));
            assert_eq!(vec!["mysql_pgsql".to_string()], config.scenario_sets.iter().map(ScenarioSet::name).collect::<Vec<_>>());
            assert_eq!(Some(&"b".to_string()), config.env.get("A"));
            assert_eq!(vec![Host::default()], config.hosts);
        }

        #[test]
        fn unknown_scenario_in_set() {
            let actual = merged(&[("a.yaml", "scenario_sets: [[mysql]]")]);

            assert_eq!(
                vec![Error {
                    filename: "a.yaml".to_string(),
                    message: "invalid scenario set".to_string(),
                    violations: vec![Violation {
                        filename: "a.yaml".to_string(),
                        path: "$.scenario_sets[0]".to_string(),
                        message: "unknown scenario \"mysql\"".to_string(),
                    }],
                }],
                actual.unwrap_err()
            );
        }
    }

    #[test]
    fn get_scenario_sets_is_cached_per_layer() {
        let config = merged(&[(
            FILENAME,
            "scenarios: [{name: mysql, family: database}, {name: pgsql, family: database}]\nnot_scenarios: [PGSQL]",
        )])
        .unwrap();

        let core = config.get_scenario_sets(PermutationLayer::Core);
        let application = config.get_scenario_sets(PermutationLayer::Application);

        assert!(Arc::ptr_eq(&core, &config.get_scenario_sets(PermutationLayer::Core)));
        assert!(core.is_empty());
        assert_eq!(
            vec!["mysql_local-filesystem_cli_no-code-cache".to_string()],
            application.iter().map(ScenarioSet::name).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn hooks_get_context_and_failures_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let source = format!(
            "hooks:\n  process_test_pack: [bash, -c, 'exit 1']\n  process_test_case: [bash, -c, 'echo \"$SAPIRUN_SCENARIO_SET $SAPIRUN_TEST_NAME\" > {}']",
            out.display()
        );
        let config = merged(&[(FILENAME, &source)]).unwrap();
        let set = ScenarioSet::new(vec![]).ensure_contains_critical(&[]);

        config.process_test_pack(dir.path(), &set).await;
        config
            .process_test_case(dir.path(), &set, &plain_test("a.phpt"))
            .await;

        assert!(config.has_hooks(HookKind::ProcessTestCase));
        assert_eq!(
            format!("{} a.phpt\n", set.name()),
            std::fs::read_to_string(out).unwrap()
        );
    }
}
