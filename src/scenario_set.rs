use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    ini::PhpIni,
    scenario::{SapiKind, Scenario, ScenarioFamily},
};

/// A complete combination of scenarios describing one environment to test.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    scenarios: Vec<Arc<Scenario>>,
}

impl PartialEq for ScenarioSet {
    // member order only matters for display
    fn eq(&self, other: &Self) -> bool {
        self.scenarios.len() == other.scenarios.len()
            && self.scenarios.iter().all(|s| other.contains(s))
    }
}

impl Eq for ScenarioSet {}

impl ScenarioSet {
    pub fn new<I: IntoIterator<Item = Arc<Scenario>>>(scenarios: I) -> Self {
        let mut set = Self { scenarios: vec![] };
        scenarios.into_iter().for_each(|s| set.push(s));
        set
    }

    fn push(&mut self, scenario: Arc<Scenario>) {
        if !self.contains(&scenario) {
            self.scenarios.push(scenario);
        }
    }

    pub fn name(&self) -> String {
        self.scenarios
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn scenarios(&self) -> &[Arc<Scenario>] {
        &self.scenarios
    }

    pub fn contains(&self, scenario: &Scenario) -> bool {
        self.scenarios.iter().any(|s| s.as_ref() == scenario)
    }

    /// First scenario of the given family.
    pub fn get(&self, family: ScenarioFamily) -> Option<&Arc<Scenario>> {
        self.scenarios.iter().find(|s| s.family == family)
    }

    /// Returns a copy of this set with a scenario for every critical family.
    ///
    /// Scenarios flagged critical in `available` are added for any family the
    /// set lacks, before the built-in defaults fill the rest.
    pub fn ensure_contains_critical(&self, available: &[Arc<Scenario>]) -> Self {
        let mut set = self.clone();
        for scenario in available.iter().filter(|s| s.is_critical()) {
            if set.get(scenario.family).is_none() {
                set.push(scenario.clone());
            }
        }
        for family in ScenarioFamily::CRITICAL {
            if set.get(family).is_none() {
                if let Some(scenario) = family.default_scenario() {
                    set.push(Arc::new(scenario));
                }
            }
        }
        set
    }

    pub fn sapi(&self) -> SapiKind {
        self.get(ScenarioFamily::Sapi)
            .and_then(|s| s.sapi.clone())
            .unwrap_or(SapiKind::Cli)
    }

    /// INI contributions of all members, in member order.
    pub fn ini(&self) -> PhpIni {
        let mut ini = PhpIni::new();
        self.scenarios.iter().for_each(|s| ini.replace_all(&s.ini));
        ini
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        self.scenarios
            .iter()
            .flat_map(|s| s.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}
