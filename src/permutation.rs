use std::sync::Arc;

use clap::ValueEnum;
use indexmap::IndexMap;

use crate::{
    scenario::{Scenario, ScenarioFamily},
    scenario_set::ScenarioSet,
};

/// How permissively scenarios of one family may be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum PermutationLayer {
    /// Runtime tests; all database scenarios are exercised together.
    Core,
    /// Application tests; at most one scenario per family.
    Application,
}

impl PermutationLayer {
    fn is_exclusive(&self, family: ScenarioFamily) -> bool {
        match self {
            PermutationLayer::Core => family != ScenarioFamily::Database,
            PermutationLayer::Application => true,
        }
    }
}

/// Builds every scenario set to run for `scenarios` under `layer`.
///
/// `configured` sets come first, followed by the generated product in the
/// order families were first seen. Every result carries the critical
/// families and appears once.
pub fn permute(
    layer: PermutationLayer,
    scenarios: &[Arc<Scenario>],
    configured: &[ScenarioSet],
) -> Vec<ScenarioSet> {
    let mut families: IndexMap<ScenarioFamily, Vec<Arc<Scenario>>> = IndexMap::new();
    scenarios
        .iter()
        .filter(|s| !s.is_critical())
        .for_each(|s| families.entry(s.family).or_default().push(s.clone()));

    // each family contributes a list of alternatives; a non-exclusive family
    // has a single alternative holding all of its scenarios
    let options = families.into_iter().map(|(family, members)| {
        if layer.is_exclusive(family) {
            members.into_iter().map(|s| vec![s]).collect::<Vec<_>>()
        } else {
            vec![members]
        }
    });

    let generated = options.fold(vec![vec![]], |acc: Vec<Vec<Arc<Scenario>>>, alternatives| {
        acc.iter()
            .flat_map(|prefix| {
                alternatives.iter().map(move |alternative| {
                    prefix.iter().chain(alternative.iter()).cloned().collect()
                })
            })
            .collect()
    });

    let mut sets: Vec<ScenarioSet> = vec![];
    configured
        .iter()
        .cloned()
        .chain(generated.into_iter().map(ScenarioSet::new))
        .map(|set| set.ensure_contains_critical(scenarios))
        .for_each(|set| {
            if !sets.contains(&set) {
                sets.push(set);
            }
        });
    sets
}

/// Drops every set whose name contains one of `fragments`, ignoring case.
pub fn exclude(fragments: &[String], sets: Vec<ScenarioSet>) -> Vec<ScenarioSet> {
    let fragments = fragments
        .iter()
        .map(|f| f.to_lowercase())
        .collect::<Vec<_>>();

    sets.into_iter()
        .filter(|set| {
            let name = set.name().to_lowercase();
            !fragments.iter().any(|f| name.contains(f.as_str()))
        })
        .collect()
}
