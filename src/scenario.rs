use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{
    exec::{display_command, execute_command, Status},
    ini::PhpIni,
};

const SETUP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScenarioFamily {
    Sapi,
    Database,
    Filesystem,
    CodeCache,
    Os,
    Application,
}

impl ScenarioFamily {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sapi" => Some(ScenarioFamily::Sapi),
            "database" => Some(ScenarioFamily::Database),
            "filesystem" => Some(ScenarioFamily::Filesystem),
            "code_cache" => Some(ScenarioFamily::CodeCache),
            "os" => Some(ScenarioFamily::Os),
            "application" => Some(ScenarioFamily::Application),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioFamily::Sapi => "sapi",
            ScenarioFamily::Database => "database",
            ScenarioFamily::Filesystem => "filesystem",
            ScenarioFamily::CodeCache => "code_cache",
            ScenarioFamily::Os => "os",
            ScenarioFamily::Application => "application",
        }
    }

    /// Families every scenario set must carry one scenario of.
    pub const CRITICAL: [ScenarioFamily; 3] = [
        ScenarioFamily::Filesystem,
        ScenarioFamily::Sapi,
        ScenarioFamily::CodeCache,
    ];

    /// Scenario used for a critical family when configuration supplies none.
    pub fn default_scenario(&self) -> Option<Scenario> {
        match self {
            ScenarioFamily::Filesystem => Some(Scenario::new("local-filesystem", *self)),
            ScenarioFamily::Sapi => Some(Scenario::new("cli", *self).with_sapi(SapiKind::Cli)),
            ScenarioFamily::CodeCache => Some(Scenario::new("no-code-cache", *self)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSapi {
    pub port: u16,
    pub threads: usize,
    pub start_timeout: Duration,
}

impl Default for WebSapi {
    fn default() -> Self {
        Self {
            port: 40080,
            threads: 4,
            start_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApacheSapi {
    pub web: WebSapi,
    pub httpd: PathBuf,
    pub module: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SapiKind {
    Cli,
    BuiltinWeb(WebSapi),
    Apache(ApacheSapi),
}

impl SapiKind {
    pub fn threads(&self) -> usize {
        match self {
            SapiKind::Cli => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            SapiKind::BuiltinWeb(web) => web.threads,
            SapiKind::Apache(apache) => apache.web.threads,
        }
    }
}

/// One facet of a test environment.
///
/// Scenarios are shared between sets and never mutated once configured.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub family: ScenarioFamily,
    pub critical: bool,
    pub ini: PhpIni,
    pub env: BTreeMap<String, String>,
    pub setup: Option<Vec<String>>,
    pub teardown: Option<Vec<String>>,
    pub sapi: Option<SapiKind>,
}

impl PartialEq for Scenario {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.name == other.name
    }
}

impl Eq for Scenario {}

impl Scenario {
    pub fn new(name: &str, family: ScenarioFamily) -> Self {
        Self {
            name: name.to_string(),
            family,
            critical: false,
            ini: PhpIni::new(),
            env: BTreeMap::new(),
            setup: None,
            teardown: None,
            sapi: None,
        }
    }

    pub fn with_sapi(mut self, sapi: SapiKind) -> Self {
        self.sapi = Some(sapi);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub async fn setup(&self, env: &[(String, String)]) -> Result<(), String> {
        self.run_command("setup", self.setup.as_deref(), env).await
    }

    pub async fn teardown(&self, env: &[(String, String)]) -> Result<(), String> {
        self.run_command("teardown", self.teardown.as_deref(), env).await
    }

    async fn run_command(
        &self,
        phase: &str,
        command: Option<&[String]>,
        env: &[(String, String)],
    ) -> Result<(), String> {
        let Some(command) = command else {
            return Ok(());
        };
        tracing::debug!(scenario = %self.name, command = %display_command(command), "running {}", phase);

        let output = execute_command(command, "", env, None, SETUP_TIMEOUT).await?;
        match output.status {
            Status::Exit(0) => Ok(()),
            Status::Exit(code) => Err(format!(
                "{} of scenario {} exited with status {}: {}",
                phase,
                self.name,
                code,
                output.stderr.trim_end()
            )),
            Status::Signal(signal) => Err(format!(
                "{} of scenario {} was killed by signal {}",
                phase, self.name, signal
            )),
            Status::Timeout => Err(format!("{} of scenario {} timed out", phase, self.name)),
        }
    }
}
